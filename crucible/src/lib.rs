//! Top-level CLI crate: a small `clap` surface ([`cli`]) over the subsystems below it, each
//! command in [`commands`] a thin translation from parsed flags into a `crucible-parse` /
//! `crucible-crypto` / `crucible-smtp` call.
//!
//! This replaces the package's old role as a replicated-server frontend (`ServerState`,
//! `ServerTrait`, `ServerImpl`), which this CLI has no use for.

pub mod cli;
pub mod commands;

use crucible_base::{ErrorKind, Result};
use cli::Command;

pub fn run(cli: cli::Cli) -> Result<()> {
    match cli.command {
        Command::Enums => commands::enums_cmd::run(),
        Command::Addrs { file } => commands::addrs_cmd::run(file),
        Command::Dkimgen { out_file } => commands::dkim_cmd::gen(out_file),
        Command::Dkimpub { file } => commands::dkim_cmd::pub_from_file(file),
        Command::Genmsg {
            out,
            mkdn,
            from,
            to,
            cc,
            subject,
            kp,
            sdid,
            sel,
            attach,
        } => commands::genmsg_cmd::run(out, mkdn, from, to, cc, subject, kp, sdid, sel, attach),
        Command::Run { stgs } => commands::run_cmd::run(stgs),
        Command::Sendmsg {
            stgs,
            from,
            mbox,
            content,
            retry,
            tls_req,
            base_secs_max,
            min_bps,
        } => commands::sendmsg_cmd::run(stgs, from, mbox, content, retry, tls_req, base_secs_max, min_bps),
    }
}

/// Maps an error to the process exit code `bin.rs` should use: usage errors (bad flags, bad
/// input files) exit 2, everything else exits 1. Mirrors the split the original test harness
/// drew between its `UsageErr` exception and every other exception type.
pub fn exit_code_for(err: &crucible_base::Error) -> i32 {
    if err.kind() == ErrorKind::Input {
        2
    } else {
        1
    }
}
