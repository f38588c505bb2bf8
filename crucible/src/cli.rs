//! Subcommand surface. Mirrors the library's own feature set one-for-one rather than adding any
//! CLI-only logic: every handler below is a thin translation from parsed arguments to a call into
//! `crucible-parse`, `crucible-crypto`, or `crucible-smtp`.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crucible", version, about = "Entity store and SMTP send pipeline -- test and operations CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print every enumeration this crate exposes: value index, name, and description.
    Enums,

    /// Parse an address list. With no file, prints a hardcoded sample list as parseable input.
    Addrs { file: Option<String> },

    /// Generate a DKIM RSA keypair and write it to a file (hex private key, then the DNS public
    /// key record text).
    Dkimgen { out_file: String },

    /// Read a DKIM private key written by `dkimgen` and print its public key record text.
    Dkimpub { file: String },

    /// Generate an IMF/MIME message from a markdown body, optional attachments, and optional
    /// DKIM signing.
    Genmsg {
        #[arg(short = 'o', long)]
        out: Option<String>,
        #[arg(long)]
        mkdn: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long = "sub")]
        subject: Option<String>,
        #[arg(long)]
        kp: Option<String>,
        #[arg(long)]
        sdid: Option<String>,
        #[arg(long)]
        sel: Option<String>,
        /// `--attach <content-type> <file>`, repeatable.
        #[arg(long, num_args = 2, value_names = ["TYPE", "FILE"])]
        attach: Vec<String>,
    },

    /// Start the send-queue service against the settings envelope and wait for Esc/q, Space to
    /// list in-flight messages, or 'c' to clear idle ones.
    Run {
        #[arg(long)]
        stgs: Option<String>,
    },

    /// Start the service and enqueue one message built from the given flags.
    Sendmsg {
        #[arg(long)]
        stgs: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        mbox: Vec<String>,
        #[arg(long)]
        content: Option<String>,
        /// Comma-separated retry delays in minutes, replacing the default schedule.
        #[arg(long)]
        retry: Option<String>,
        #[arg(long = "tlsreq")]
        tls_req: Option<String>,
        #[arg(long = "basesecsmax")]
        base_secs_max: Option<u32>,
        #[arg(long = "minbps")]
        min_bps: Option<u32>,
    },
}
