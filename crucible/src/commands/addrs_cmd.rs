//! `addrs [file]`: parse a file as a single multiline string holding a casual address list, or
//! with no file, print a hardcoded list exercising the same syntax (quoted display names, groups,
//! comments, folding, and stray angle brackets) so it can be piped straight back in as input.

use crucible_base::{err, Result};
use crucible_parse::addr::extract_addresses;
use crucible_parse::AddrSpec;

const SAMPLE: &str = "\"Name M. Surname\" <aa@bb>; group:aa@bb,cc@dd;, First\r\n\
 Last <xx@yy>,; \";,_\" (uff) @ (f;u,f) example.com,,, \";,_\" <\";,_\" (uff) @ (f;u,f) example.com>\r\n\
aa@bb\r\n\
  Name Surname <cc@dd>  \r\n\
multiline\r\n\
 @example.com; Foo Bar <multiline(\r\n\
 )@example.com>; \"Foo Bar\" <multiline@(\r\n\
 )example.com> <zz@zz> \"[First Last]\" <ww@ww>zz@ee<foo@bar>Last<last@example.com>\r\n";

pub fn run(file: Option<String>) -> Result<()> {
    let Some(path) = file else {
        print!("{SAMPLE}");
        return Ok(());
    };

    let text = std::fs::read_to_string(&path).map_err(|e| err(format!("could not read {path:?}: {e}")))?;

    let mut addresses: Vec<AddrSpec> = Vec::new();
    let result = extract_addresses(text.as_bytes(), |addr| addresses.push(addr));

    match result {
        Err((diag, parsed_before_error)) => {
            println!("{diag} ({parsed_before_error} address(es) parsed before the error)");
        }
        Ok(count) => {
            println!("{count} addresses");
            for (i, addr) in addresses.iter().enumerate() {
                println!("{i}: {addr}");
            }
            if !addresses.is_empty() {
                println!();
                println!("Address parts:");
                for (i, addr) in addresses.iter().enumerate() {
                    println!("{i}: localPart=<{}>, domain=<{}>", addr.local_part, addr.domain);
                }
            }
        }
    }
    Ok(())
}
