use std::collections::BTreeSet;
use std::time::Duration;

use oni_nostr::{parse_secret_key, Keypair, Pubkey};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Resolve a user and print what was found
    #[default]
    Bootstrap,
    /// Announce a stream, keep it fresh, then end it
    Live,
}

pub const DEFAULT_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Args {
    pub mode: Mode,
    pub keys: Vec<Keypair>,
    pub relays: Vec<String>,
    pub indexers: Vec<String>,
    pub no_discovery: bool,
    pub datapath: Option<String>,
    pub title: Option<String>,
    pub stream_url: Option<String>,
    pub duration: Duration,
    pub viewers: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            keys: vec![],
            relays: vec![],
            indexers: vec![],
            no_discovery: false,
            datapath: None,
            title: None,
            stream_url: None,
            duration: DEFAULT_DURATION,
            viewers: 0,
        }
    }
}

impl Args {
    /// Parses everything after the program name. Anything we don't know is
    /// handed back so the caller can complain about it.
    pub fn parse(args: &[String]) -> (Self, BTreeSet<String>) {
        let mut unrecognized_args = BTreeSet::new();
        let mut res = Args::default();

        let mut i = 0;
        let len = args.len();
        while i < len {
            let arg = &args[i];

            if arg == "bootstrap" {
                res.mode = Mode::Bootstrap;
            } else if arg == "live" {
                res.mode = Mode::Live;
            } else if arg == "--pub" || arg == "--npub" {
                i += 1;
                let Some(pubstr) = args.get(i) else {
                    error!("{arg} argument missing?");
                    continue;
                };

                if let Ok(pk) = Pubkey::parse(pubstr) {
                    res.keys.push(Keypair::only_pubkey(pk));
                } else {
                    error!(
                        "failed to parse {} argument. Make sure to use hex or npub.",
                        arg
                    );
                }
            } else if arg == "--sec" || arg == "--nsec" {
                i += 1;
                let Some(secstr) = args.get(i) else {
                    error!("{arg} argument missing?");
                    continue;
                };

                if let Ok(sec) = parse_secret_key(secstr) {
                    res.keys.push(Keypair::from_secret(sec));
                } else {
                    error!(
                        "failed to parse {} argument. Make sure to use hex or nsec.",
                        arg
                    );
                }
            } else if arg == "--datapath" {
                i += 1;
                let Some(datapath) = args.get(i) else {
                    error!("datapath argument missing?");
                    continue;
                };
                res.datapath = Some(datapath.clone());
            } else if arg == "-r" || arg == "--relay" {
                i += 1;
                let Some(relay) = args.get(i) else {
                    error!("relay argument missing?");
                    continue;
                };
                res.relays.push(relay.clone());
            } else if arg == "--indexer" {
                i += 1;
                let Some(indexer) = args.get(i) else {
                    error!("indexer argument missing?");
                    continue;
                };
                res.indexers.push(indexer.clone());
            } else if arg == "--no-discovery" {
                res.no_discovery = true;
            } else if arg == "--title" {
                i += 1;
                let Some(title) = args.get(i) else {
                    error!("title argument missing?");
                    continue;
                };
                res.title = Some(title.clone());
            } else if arg == "--stream-url" {
                i += 1;
                let Some(url) = args.get(i) else {
                    error!("stream-url argument missing?");
                    continue;
                };
                res.stream_url = Some(url.clone());
            } else if arg == "--duration" {
                i += 1;
                match args.get(i).map(|s| s.parse::<u64>()) {
                    Some(Ok(secs)) => res.duration = Duration::from_secs(secs),
                    Some(Err(e)) => error!("--duration wants seconds: {e}"),
                    None => error!("duration argument missing?"),
                }
            } else if arg == "--viewers" {
                i += 1;
                match args.get(i).map(|s| s.parse::<u64>()) {
                    Some(Ok(viewers)) => res.viewers = viewers,
                    Some(Err(e)) => error!("--viewers wants a number: {e}"),
                    None => error!("viewers argument missing?"),
                }
            } else {
                unrecognized_args.insert(arg.clone());
            }

            i += 1;
        }

        (res, unrecognized_args)
    }

    /// The first key given, preferring one we can sign with
    pub fn keypair(&self) -> Option<&Keypair> {
        self.keys
            .iter()
            .find(|k| k.secret_key.is_some())
            .or_else(|| self.keys.first())
    }
}
