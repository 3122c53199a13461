//! Legacy workload file parsing.
//!
//! Lines look like `[12] BUY,alice,ABC,100.50` — a sequence prefix, the
//! command name and comma-separated arguments. Dollar amounts carry cents
//! and convert to integer cents here.

use std::io::BufRead;

use anyhow::{anyhow, bail, Context, Result};

use crate::account::Money;
use crate::commands::{Command, CommandType};

/// Parse a dollar amount like `63511.53` or `100` into cents.
pub fn parse_cents(raw: &str) -> Result<Money> {
    let raw = raw.trim();
    let (dollars, cents) = match raw.split_once('.') {
        Some((d, c)) => {
            if c.len() > 2 || c.is_empty() {
                bail!("bad cents in amount: {}", raw);
            }
            let cents: Money = c.parse().with_context(|| format!("bad amount: {}", raw))?;
            // ".5" means 50 cents, not 5.
            let cents = if c.len() == 1 { cents * 10 } else { cents };
            (d, cents)
        }
        None => (raw, 0),
    };
    let dollars: Money = dollars.parse().with_context(|| format!("bad amount: {}", raw))?;
    if dollars < 0 {
        bail!("negative amount: {}", raw);
    }
    Ok(dollars * 100 + cents)
}

/// Parse one workload line into a command. The optional `[n]` sequence
/// prefix is ignored; `txn_id` becomes the command's transaction id.
pub fn parse_line(line: &str, txn_id: u64) -> Result<Command> {
    let line = line.trim();
    let body = match line.split_once("] ") {
        Some((_, rest)) => rest,
        None => line,
    };

    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    let kind = CommandType::from_name(parts[0])
        .ok_or_else(|| anyhow!("unknown command: {}", parts[0]))?;

    let arg = |i: usize| -> Result<&str> {
        parts.get(i).copied().ok_or_else(|| anyhow!("{}: missing argument {}", parts[0], i))
    };

    use CommandType::*;
    let cmd = match kind {
        Add => Command::new(txn_id, kind, arg(1)?).with_amount(parse_cents(arg(2)?)?),
        Quote => Command::new(txn_id, kind, arg(1)?).with_symbol(arg(2)?),
        Buy | Sell | SetBuyAmount | SetBuyTrigger | SetSellAmount | SetSellTrigger => {
            Command::new(txn_id, kind, arg(1)?)
                .with_symbol(arg(2)?)
                .with_amount(parse_cents(arg(3)?)?)
        }
        CommitBuy | CancelBuy | CommitSell | CancelSell => Command::new(txn_id, kind, arg(1)?),
        CancelSetBuy | CancelSetSell => Command::new(txn_id, kind, arg(1)?).with_symbol(arg(2)?),
        Dumplog => {
            // Both spellings exist in old workload files: with and without a
            // user id before the file name.
            if parts.len() > 2 {
                Command::new(txn_id, kind, arg(1)?).with_file_name(arg(2)?)
            } else {
                Command::new(txn_id, kind, "").with_file_name(arg(1)?)
            }
        }
    };
    Ok(cmd)
}

/// Parse a whole workload file, numbering transactions from 1. Blank lines
/// are skipped; a malformed line aborts with its line number.
pub fn parse_workload<R: BufRead>(reader: R) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cmd = parse_line(&line, commands.len() as u64 + 1)
            .with_context(|| format!("workload line {}", idx + 1))?;
        commands.push(cmd);
    }
    log::info!("parsed {} workload commands", commands.len());
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("100").unwrap(), 10_000);
        assert_eq!(parse_cents("63511.53").unwrap(), 6_351_153);
        assert_eq!(parse_cents("0.07").unwrap(), 7);
        assert_eq!(parse_cents("12.5").unwrap(), 1_250);
        assert!(parse_cents("12.345").is_err());
        assert!(parse_cents("-4").is_err());
        assert!(parse_cents("abc").is_err());
    }

    #[test]
    fn test_parse_add_line() {
        let cmd = parse_line("[1] ADD,oY01WVirLr,63511.53", 1).unwrap();
        assert_eq!(cmd.command_type, CommandType::Add);
        assert_eq!(cmd.user_id, "oY01WVirLr");
        assert_eq!(cmd.amount, 6_351_153);
    }

    #[test]
    fn test_parse_buy_and_commit() {
        let buy = parse_line("[2] BUY,alice,ABC,100.50", 2).unwrap();
        assert_eq!(buy.command_type, CommandType::Buy);
        assert_eq!(buy.stock_symbol, "ABC");
        assert_eq!(buy.amount, 10_050);

        let commit = parse_line("COMMIT_BUY,alice", 3).unwrap();
        assert_eq!(commit.command_type, CommandType::CommitBuy);
        assert_eq!(commit.user_id, "alice");
    }

    #[test]
    fn test_parse_dumplog_variants() {
        let with_user = parse_line("[9] DUMPLOG,alice,out.log", 9).unwrap();
        assert_eq!(with_user.user_id, "alice");
        assert_eq!(with_user.file_name, "out.log");

        let bare = parse_line("[10] DUMPLOG,final.log", 10).unwrap();
        assert_eq!(bare.user_id, "");
        assert_eq!(bare.file_name, "final.log");
    }

    #[test]
    fn test_parse_workload_numbers_transactions() {
        let input = "[1] ADD,u1,100\n\n[2] QUOTE,u1,ABC\n[3] CANCEL_SET_BUY,u1,ABC\n";
        let commands = parse_workload(input.as_bytes()).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].transaction_id, 1);
        assert_eq!(commands[2].transaction_id, 3);
        assert_eq!(commands[2].command_type, CommandType::CancelSetBuy);
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(parse_line("[1] HOLD,u1,ABC", 1).is_err());
    }
}
