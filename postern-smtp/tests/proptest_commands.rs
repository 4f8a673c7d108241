//! Property-based tests for SMTP command parsing.
//!
//! Whatever bytes arrive, the parser must return a value, never panic, and
//! must keep its invariants: verbs are case-insensitive, recognised paths
//! round-trip, and oversized lines are always the distinguished error.

use postern_smtp::command::{Command, ParseError, MAX_COMMAND_LINE};
use proptest::prelude::*;

fn domain_strategy() -> impl Strategy<Value = String> {
    "[a-z]{3,10}\\.[a-z]{2,5}"
}

fn local_part_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9+_-]{1,12}"
}

fn email_strategy() -> impl Strategy<Value = String> {
    (local_part_strategy(), domain_strategy()).prop_map(|(local, domain)| format!("{local}@{domain}"))
}

proptest! {
    #[test]
    fn parser_never_panics_on_arbitrary_bytes(line in proptest::collection::vec(any::<u8>(), 0..600)) {
        let _ = Command::parse(&line);
    }

    #[test]
    fn oversized_lines_are_always_line_too_long(
        len in (MAX_COMMAND_LINE + 1)..(MAX_COMMAND_LINE * 2),
        byte in any::<u8>(),
    ) {
        let line = vec![byte; len];
        prop_assert_eq!(Command::parse(&line), Err(ParseError::LineTooLong));
    }

    #[test]
    fn mail_from_round_trips_address(address in email_strategy()) {
        let line = format!("MAIL FROM:<{address}>");
        let command = Command::parse(line.as_bytes()).unwrap();
        prop_assert_eq!(
            command,
            Command::MailFrom(Some(address), postern_smtp::command::MailParameters::default())
        );
    }

    #[test]
    fn rcpt_to_round_trips_address(address in email_strategy()) {
        let line = format!("RCPT TO:<{address}>");
        match Command::parse(line.as_bytes()).unwrap() {
            Command::RcptTo(parsed, _) => prop_assert_eq!(parsed, address),
            other => prop_assert!(false, "unexpected command {other:?}"),
        }
    }

    #[test]
    fn verbs_are_case_insensitive(
        address in email_strategy(),
        upper in proptest::collection::vec(any::<bool>(), 4),
    ) {
        let verb: String = "mail"
            .chars()
            .zip(upper.iter().cycle())
            .map(|(c, &up)| if up { c.to_ascii_uppercase() } else { c })
            .collect();
        let line = format!("{verb} FROM:<{address}>");
        prop_assert!(matches!(
            Command::parse(line.as_bytes()),
            Ok(Command::MailFrom(Some(_), _))
        ));
    }

    #[test]
    fn declared_size_is_read_back(address in email_strategy(), size in 1u64..u64::MAX) {
        let line = format!("MAIL FROM:<{address}> SIZE={size}");
        match Command::parse(line.as_bytes()).unwrap() {
            Command::MailFrom(_, params) => prop_assert_eq!(params.declared_size, Some(size)),
            other => prop_assert!(false, "unexpected command {other:?}"),
        }
    }

    #[test]
    fn bdat_sizes_round_trip(size in any::<u64>(), last in any::<bool>()) {
        let line = if last {
            format!("BDAT {size} LAST")
        } else {
            format!("BDAT {size}")
        };
        prop_assert_eq!(
            Command::parse(line.as_bytes()),
            Ok(Command::Bdat { size, last })
        );
    }
}
