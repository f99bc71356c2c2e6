//! Spawned by TeX to open the reverse channel.
//!
//! Prints the handshake configuration (carrying the communicator address) on
//! stdout, then relays whatever the sibling process sends onto stdout, which
//! TeX reads.

use std::io::{self, Write};
use std::process;

use anyhow::Context;
use texlink::{encode_config, select_transport};
use texlink_forward::{EXTRA_ARGS_ENV, ForwardArgs, USAGE, collect_args, init_tracing, parse_args};

fn main() {
    init_tracing();

    let extra = std::env::var(EXTRA_ARGS_ENV).ok();
    let args = match parse_args(&collect_args(extra.as_deref())) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(&args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(args: &ForwardArgs) -> anyhow::Result<()> {
    let transport = select_transport(args.mode)?;
    let (communicator, forwarder) = transport
        .setup()
        .with_context(|| format!("failed to set up {} transport", transport.mode()))?;

    let config = args.configuration().with_communicator(communicator);
    let payload = encode_config(&config)?;
    tracing::debug!(mode = %transport.mode(), bytes = payload.len(), "Sending configuration");

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{payload}").context("failed to write configuration")?;
    stdout.flush()?;

    forwarder.run(&mut stdout).context("forwarding failed")?;
    Ok(())
}
