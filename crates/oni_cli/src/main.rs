mod args;

use std::process::ExitCode;
use std::rc::Rc;
use std::time::{Duration, Instant};

use oni_live::relay_profiles::OUTBOX;
use oni_live::{
    BootstrapPhase, BootstrapState, DataPath, DataPathType, FileStore, Session, SessionConfig,
};
use oni_nostr::{EwebsockConnector, Keypair, LocalSigner, NoopWakeup, Signer};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{
    non_blocking,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::EnvFilter;

use crate::args::{Args, Mode};

const TICK: Duration = Duration::from_millis(100);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(45);
const END_TIMEOUT: Duration = Duration::from_secs(15);

/// Console plus a daily log file under the data directory. Keep the guard
/// alive or the file writer stops.
fn setup_logging(path: &DataPath) -> WorkerGuard {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        path.path(DataPathType::Log),
        format!("oni-{}.log", env!("CARGO_PKG_VERSION")),
    );
    let (non_blocking_writer, guard) = non_blocking(file_appender);

    // Log to stdout (if you run with `RUST_LOG=debug`).
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stdout);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_writer);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("oni=info,oni_live=info,oni_nostr=warn"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    guard
}

fn session_config(args: &Args) -> SessionConfig {
    let mut config = SessionConfig::default();
    if !args.indexers.is_empty() {
        config.bootstrap.fallback_indexers = args.indexers.clone();
    }
    if args.no_discovery {
        config.bootstrap.discover_indexers = false;
        config.no_broadcast_discovery = true;
    }
    if !args.relays.is_empty() {
        config.live.fallback_relays = args.relays.clone();
    }
    config
}

fn signer_for(keypair: &Keypair) -> Option<Rc<dyn Signer>> {
    keypair
        .to_full()
        .map(|full| Rc::new(LocalSigner::new(full)) as Rc<dyn Signer>)
}

/// Polls until bootstrap settles or `timeout` passes
async fn wait_for_bootstrap(session: &mut Session, timeout: Duration) -> BootstrapPhase {
    let deadline = Instant::now() + timeout;
    loop {
        session.poll(Instant::now());
        let phase = session.bootstrap_state().phase;
        if !phase.is_in_flight() {
            return phase;
        }
        if Instant::now() >= deadline {
            warn!("bootstrap still {:?} after {:?}", phase, timeout);
            return phase;
        }
        tokio::time::sleep(TICK).await;
    }
}

fn print_bootstrap(state: &BootstrapState) {
    let Some(pubkey) = state.pubkey else {
        return;
    };

    println!("pubkey:    {}", pubkey.npub().unwrap_or_else(|| pubkey.hex()));
    match &state.profile {
        Some(profile) => {
            println!("name:      {}", profile.best_name(&pubkey));
            if let Some(nip05) = profile.nip05() {
                println!("nip05:     {nip05}");
            }
            if let Some(about) = profile.about() {
                println!("about:     {about}");
            }
        }
        None => println!("name:      (no profile found)"),
    }
    println!("following: {}", state.following_count);
    println!(
        "indexers:  {}/{} answered",
        state.indexers_responded, state.indexers_queried
    );

    if state.relay_list.is_empty() {
        println!("relays:    (no relay list found)");
    } else {
        println!("relays:");
        for relay in &state.relay_list {
            let marker = match (relay.is_readable(), relay.is_writable()) {
                (true, true) => "read/write",
                (true, false) => "read",
                (false, true) => "write",
                (false, false) => "",
            };
            println!("  {} {}", relay.url, marker);
        }
        println!(
            "connected: {} outbox, {} inbox",
            state.outbox_connected, state.inbox_connected
        );
    }

    if let Some(err) = &state.error {
        println!("error:     {err}");
    }
}

async fn run_bootstrap(session: &mut Session) -> ExitCode {
    let phase = wait_for_bootstrap(session, BOOTSTRAP_TIMEOUT).await;
    print_bootstrap(session.bootstrap_state());

    if phase == BootstrapPhase::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_live(session: &mut Session, args: &Args) -> ExitCode {
    if session.signer().is_none() {
        error!("live mode needs a secret key (--sec)");
        return ExitCode::FAILURE;
    }

    // outbox relays are publish targets, so find them first
    wait_for_bootstrap(session, BOOTSTRAP_TIMEOUT).await;

    session.live.set_enabled(true);
    session.live.stream_started(
        args.title.as_deref().unwrap_or_default(),
        args.stream_url.clone(),
        args.viewers,
    );

    let stop_at = Instant::now() + args.duration;
    info!("streaming for {:?}", args.duration);
    while Instant::now() < stop_at {
        session.poll(Instant::now());
        if let Some(err) = session.live.error() {
            error!("{err}");
            return ExitCode::FAILURE;
        }
        tokio::time::sleep(TICK).await;
    }

    session.live.stream_ended();
    let end_by = Instant::now() + END_TIMEOUT;
    loop {
        session.poll(Instant::now());
        let done = !session.live.is_publishing() && session.live.current().is_none();
        if done || Instant::now() >= end_by {
            break;
        }
        tokio::time::sleep(TICK).await;
    }

    match session.live.last_outcome() {
        Some(outcome) => {
            for (url, result) in &outcome.results {
                let verdict = if result.accepted { "ok" } else { "failed" };
                println!("{url}: {verdict} {}", result.message);
            }
            ExitCode::SUCCESS
        }
        None => {
            warn!("stream end was never published");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli_args: Vec<String> = std::env::args().skip(1).collect();
    let (args, unrecognized_args) = Args::parse(&cli_args);

    let path = args
        .datapath
        .as_ref()
        .map(DataPath::new)
        .unwrap_or_default();
    let _log_guard = setup_logging(&path);

    for arg in &unrecognized_args {
        warn!("unrecognized argument: {arg}");
    }

    let Some(keypair) = args.keypair().cloned() else {
        error!("no key given, use --pub or --sec");
        return ExitCode::FAILURE;
    };

    let connector = Rc::new(EwebsockConnector::new(NoopWakeup));
    let store = Rc::new(FileStore::from_data_path(&path));
    let mut session = Session::new(session_config(&args), connector, store);

    for relay in &args.relays {
        if let Err(e) = session
            .profiles
            .add_relay(OUTBOX, relay, &mut session.pool)
        {
            warn!("skipping relay {relay}: {e}");
        }
    }

    session.login(keypair.pubkey, signer_for(&keypair), Instant::now());

    let code = match args.mode {
        Mode::Bootstrap => run_bootstrap(&mut session).await,
        Mode::Live => run_live(&mut session, &args).await,
    };

    session.pool.disconnect_all();
    code
}
