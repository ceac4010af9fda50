use std::time::Duration;

use clap::Parser;
use imap_engine::{ConnectionMode, MessageArrival, SessionBuilder, WatchMode, WatchOptions};
use tracing_subscriber::EnvFilter;

/// Wait for new mail in a mailbox and print the headers of what arrives.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Host name of the IMAP server.
    #[arg(long)]
    server: String,

    #[arg(long, default_value_t = 993)]
    port: u16,

    /// Use STARTTLS instead of TLS from the start.
    #[arg(long)]
    starttls: bool,

    #[arg(long)]
    username: String,

    #[arg(long)]
    password: String,

    #[arg(long, default_value = "INBOX")]
    mailbox: String,

    /// Poll with NOOP every this many seconds instead of using IDLE.
    #[arg(long)]
    poll: Option<u64>,
}

fn main() -> imap_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut builder = SessionBuilder::new(args.server.as_str(), args.port);
    if args.starttls {
        builder.mode(ConnectionMode::StartTls);
    }
    let mut session = builder.login(&args.username, &args.password)?;

    let mailbox = session.select(&args.mailbox)?.into_value()?;
    println!(
        "{}: {} messages",
        args.mailbox,
        session.mailbox(mailbox)?.exists
    );

    let options = match args.poll {
        Some(seconds) => WatchOptions {
            mode: WatchMode::Polling,
            polling_interval: Duration::from_secs(seconds),
            ..WatchOptions::default()
        },
        None => WatchOptions::default(),
    };
    let goal = MessageArrival::for_mailbox(session.mailbox(mailbox)?);
    let mut watch = session.watch(goal, options)?;
    while !watch.wait(Duration::from_secs(60)) {
        println!("still waiting");
    }
    let report = session.stop_watch(watch)?;

    if let Some(arrived) = report.goal.arrived() {
        let set = format!("{}:{}", arrived.start(), arrived.end());
        let fetches = session
            .fetch(&set, "(UID BODY.PEEK[HEADER.FIELDS (FROM SUBJECT)])")?
            .into_value()?;
        for fetch in &fetches {
            let header = fetch.body().unwrap_or_default();
            println!(
                "{:?}: {}",
                fetch.uid,
                String::from_utf8_lossy(header).trim_end()
            );
        }
    }

    session.disconnect(true)
}
