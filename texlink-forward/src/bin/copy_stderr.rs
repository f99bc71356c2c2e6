//! Copies stdin to stderr line by line. Lets TeX write to its own stderr.

use std::io;

fn main() -> anyhow::Result<()> {
    texlink_forward::copy_lines(io::stdin().lock(), io::stderr().lock())?;
    Ok(())
}
