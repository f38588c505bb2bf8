//! `enums`: dump every enumeration the send pipeline exposes, as `index, name, description`
//! triples grouped under the enum's own name -- a reproducible fixture a test harness can diff
//! across versions.

use crucible_smtp::{AuthType, ErrorClass, IpVerPref, MsgStatus, Stage, TlsAssurance};

use crucible_base::Result;

fn print_group(title: &str, rows: impl Iterator<Item = (usize, &'static str, &'static str)>) {
    println!();
    println!("{title}");
    for (value, name, desc) in rows {
        println!("{value}, {name}, {desc}");
    }
}

pub fn run() -> Result<()> {
    print_group(
        "IpVerPref",
        IpVerPref::ALL.iter().enumerate().map(|(i, v)| (i, v.as_str(), v.describe())),
    );
    print_group(
        "TlsAssurance",
        TlsAssurance::ALL.iter().enumerate().map(|(i, v)| (i, v.as_str(), v.describe())),
    );
    print_group(
        "AuthType",
        AuthType::ALL.iter().enumerate().map(|(i, v)| (i, v.as_str(), v.describe())),
    );
    print_group(
        "MsgStatus",
        MsgStatus::ALL.iter().enumerate().map(|(i, v)| (i, v.as_str(), v.describe())),
    );
    print_group(
        "Stage",
        Stage::ALL.iter().enumerate().map(|(i, v)| (i, v.as_str(), v.describe())),
    );
    print_group(
        "ErrorClass",
        ErrorClass::ALL.iter().enumerate().map(|(i, v)| (i, v.as_str(), v.describe())),
    );
    Ok(())
}
