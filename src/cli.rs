//! CLI surface (spec §6). Parsing itself is ambient stack (see
//! SPEC_FULL.md §0.3) but the flags and defaults are exactly as specified.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sidecar-proxy", about = "Credential-injecting MITM forward proxy")]
pub struct Cli {
    /// Location of sidecar.json.
    #[arg(long, default_value = "sidecar.json")]
    pub config: String,

    /// Overrides the listen port from the config file.
    #[arg(long)]
    pub port: Option<u16>,

    /// Elevates logging verbosity (rule matches, expansion diagnostics — never secret values).
    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    /// Produce CA files then exit 0.
    #[arg(long, default_value_t = false)]
    pub generate_ca: bool,
}
