use clap::{Parser, Subcommand};
use pulse_core::host::HostState;
use pulse_core::journal::read_summaries;
use pulse_core::simulator::{MetricsSample, SimulatedHost};
use pulse_core::stream::Subscription;
use pulse_core::theme::FileStore;
use pulse_core::transport::{MemoryNetwork, Transport};
use pulse_core::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "pulse")]
#[command(about = "Exercise session controller with companion sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated session against an in-memory host and companion
    Simulate {
        /// Session id (generated when omitted)
        #[arg(long)]
        session_id: Option<i64>,

        /// Number of metrics ticks to report
        #[arg(long, default_value_t = 6)]
        ticks: u32,

        /// Calories burned per tick
        #[arg(long, default_value_t = 50.0)]
        calories_per_tick: f64,

        /// Make the companion unreachable for the whole session
        #[arg(long)]
        unreachable: bool,

        /// Have the host auto-pause (and resume) before this tick
        #[arg(long)]
        auto_pause_at: Option<u32>,
    },

    /// List summaries received by the companion
    History,

    /// Roll up the summary journal to CSV
    Rollup {
        /// Clean up processed journals after rollup
        #[arg(long)]
        cleanup: bool,
    },

    /// Send a theme from the companion to the host
    Theme {
        #[arg(long)]
        character: i32,

        #[arg(long)]
        background: i32,
    },
}

struct SimulateOptions {
    session_id: Option<i64>,
    ticks: u32,
    calories_per_tick: f64,
    unreachable: bool,
    auto_pause_at: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    pulse_core::logging::init_with_level("warn");

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    match cli.command {
        Commands::Simulate {
            session_id,
            ticks,
            calories_per_tick,
            unreachable,
            auto_pause_at,
        } => {
            cmd_simulate(
                &config,
                SimulateOptions {
                    session_id,
                    ticks,
                    calories_per_tick,
                    unreachable,
                    auto_pause_at,
                },
            )
            .await
        }
        Commands::History => cmd_history(&config),
        Commands::Rollup { cleanup } => cmd_rollup(&config, cleanup),
        Commands::Theme {
            character,
            background,
        } => cmd_theme(&config, character, background).await,
    }
}

/// Receive updates until `pred` matches; returns everything seen
async fn wait_for<F>(sub: &mut Subscription<SessionUpdate>, what: &str, pred: F) -> Result<Vec<SessionUpdate>>
where
    F: Fn(&SessionUpdate) -> bool,
{
    let mut seen = Vec::new();
    let outcome = tokio::time::timeout(UPDATE_TIMEOUT, async {
        while let Some(update) = sub.recv().await {
            let done = pred(&update);
            seen.push(update);
            if done {
                return true;
            }
        }
        false
    })
    .await;

    match outcome {
        Ok(true) => Ok(seen),
        Ok(false) => Err(Error::State(format!("update stream closed waiting for {}", what))),
        Err(_) => Err(Error::State(format!("timed out waiting for {}", what))),
    }
}

fn print_goals(updates: &[SessionUpdate]) {
    for update in updates {
        if let SessionUpdate::GoalMet { goal, .. } = update {
            println!("✓ Goal met: {:?} >= {}", goal.metric, goal.threshold);
        }
    }
}

fn is_state(state: SessionState) -> impl Fn(&SessionUpdate) -> bool {
    move |u| matches!(u, SessionUpdate::StateChanged { state: s, .. } if *s == state)
}

async fn cmd_simulate(config: &Config, opts: SimulateOptions) -> Result<()> {
    let network = MemoryNetwork::new();
    let (wrist, _wrist_rx) = network.join();
    let (phone, phone_rx) = network.join();
    wrist.init().await?;
    phone.init().await?;
    if opts.unreachable {
        network.set_reachable(&phone.local_id(), false);
    }

    let sync = Arc::new(SyncBridge::new(Arc::new(wrist)));
    let binding = Arc::new(Binding::new());
    let controller =
        SessionController::new(SessionSettings::from_config(config), binding.clone(), sync.clone());
    let _pump = controller.spawn_event_pump();
    let mut updates = controller.subscribe();

    // Issued before the host is bound; waits in the binding queue
    let prepare = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.prepare().await })
    };
    while binding.pending_commands() == 0 && !prepare.is_finished() {
        tokio::task::yield_now().await;
    }
    println!("Waiting for session host ({} queued)", binding.pending_commands());

    let host = Arc::new(SimulatedHost::new());
    binding.connect(host.clone()).await;
    prepare
        .await
        .map_err(|e| Error::State(format!("prepare task failed: {}", e)))??;
    println!("Sensors ready ({})", controller.state());

    let session_id = opts
        .session_id
        .map(SessionId::from)
        .unwrap_or_else(SessionId::generate);
    match controller.start(session_id).await? {
        CommandOutcome::Applied => println!("Session {} started", session_id),
        CommandOutcome::NoOp(reason) => println!("Start ignored: {:?}", reason),
        CommandOutcome::Failed(message) => {
            println!("✗ Session failed to start: {}", message);
            return Ok(());
        }
    }

    for tick in 1..=opts.ticks {
        if opts.auto_pause_at == Some(tick) {
            host.auto_pause();
            wait_for(&mut updates, "auto-pause", is_state(SessionState::Paused)).await?;
            println!("Auto-paused before tick {}", tick);
            host.auto_resume();
            wait_for(&mut updates, "auto-resume", is_state(SessionState::Active)).await?;
            println!("Auto-resumed");
        }

        let calories = opts.calories_per_tick * f64::from(tick);
        host.report(MetricsSample {
            heart_rate: Some(110.0 + f64::from(tick) * 4.0),
            calories_total: calories,
            distance_total: f64::from(tick) * 250.0,
            active: Duration::from_secs(u64::from(tick) * 60),
        });
        let seen = wait_for(&mut updates, "metrics", |u| {
            matches!(u, SessionUpdate::Metrics { snapshot, .. } if snapshot.calories_total == calories)
        })
        .await?;
        println!("Tick {}: {:.0} kcal", tick, calories);
        print_goals(&seen);
    }

    controller.end().await?;
    // Goal events that trail the last metrics update
    while let Some(update) = updates.try_recv() {
        print_goals(std::slice::from_ref(&update));
    }

    let Some(summary) = controller.last_summary() else {
        return Err(Error::State("session ended without a summary".into()));
    };
    println!(
        "Session {} ended: {} s, {:.0} kcal, {:.0} m, avg {} bpm",
        summary.session_id,
        summary.duration_sec,
        summary.calories,
        summary.distance,
        summary.avg_heart_rate
    );

    // The companion reads what was delivered, then its inbox closes
    network.leave(&phone.local_id());
    let mut receiver =
        CompanionReceiver::new(Box::new(JsonlSummaryJournal::new(config.data.journal_path())));
    receiver.run(phone_rx).await;
    if receiver.summaries_received() > 0 {
        println!("✓ Summary delivered to companion");
        println!("  Journal: {}", config.data.journal_path().display());
    } else {
        println!("Companion unreachable, summary kept on host only");
    }

    if host.state() != HostState::Ended {
        tracing::warn!("Host finished in {:?}", host.state());
    }
    sync.transport().shutdown().await?;
    Ok(())
}

fn cmd_history(config: &Config) -> Result<()> {
    let entries = read_summaries(&config.data.journal_path())?;
    if entries.is_empty() {
        println!("No summaries recorded.");
        return Ok(());
    }

    for entry in &entries {
        let s = &entry.summary;
        println!(
            "{}  session {}: {} s, {:.0} kcal, {:.0} m, avg {} bpm",
            entry.received_at.format("%Y-%m-%d %H:%M"),
            s.session_id,
            s.duration_sec,
            s.calories,
            s.distance,
            s.avg_heart_rate
        );
    }
    println!("{} summaries", entries.len());
    Ok(())
}

fn cmd_rollup(config: &Config, cleanup: bool) -> Result<()> {
    let journal_path = config.data.journal_path();
    let csv_path = config.data.rollup_csv_path();

    if !journal_path.exists() {
        println!("No summary journal found - nothing to roll up.");
        return Ok(());
    }

    let count = pulse_core::rollup::journal_to_csv_and_archive(&journal_path, &csv_path)?;
    println!("✓ Rolled up {} summaries to CSV", count);
    println!("  CSV: {}", csv_path.display());

    if cleanup {
        if let Some(dir) = journal_path.parent() {
            let cleaned = pulse_core::rollup::cleanup_processed_journals(dir)?;
            if cleaned > 0 {
                println!("✓ Cleaned up {} processed journals", cleaned);
            }
        }
    }
    Ok(())
}

async fn cmd_theme(config: &Config, character: i32, background: i32) -> Result<()> {
    let network = MemoryNetwork::new();
    let (wrist, wrist_rx) = network.join();
    let (phone, _phone_rx) = network.join();
    phone.init().await?;

    let store = FileStore::open(config.data.theme_path())?;
    let theme = Arc::new(ThemeStore::open(Arc::new(store))?);
    let before = theme.current();
    let wrist_id = wrist.local_id();
    let host_bridge = SyncBridge::new(Arc::new(wrist)).with_theme_store(theme.clone());
    let phone_bridge = SyncBridge::new(Arc::new(phone));

    let report = phone_bridge.send_theme(character, background).await;
    if !report.reached_any() {
        return Err(Error::Delivery("theme did not reach the host".into()));
    }
    network.leave(&wrist_id);
    host_bridge.run_inbound(wrist_rx).await;

    let current = theme.current();
    if current.character_id != character || current.background_id != background {
        return Err(Error::State("host did not apply the theme".into()));
    }
    if current == before {
        println!("Theme unchanged: character {}, background {}", current.character_id, current.background_id);
    } else {
        println!("✓ Theme set: character {}, background {}", current.character_id, current.background_id);
    }
    Ok(())
}
