// Property-based tests for polling and analytics name quoting

use common::poll::{poll_until, Check, PollOutcome, PollPolicy};
use common::readers::analytics::commands;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// The check runs at most max_attempts times; it settles on the first ready answer
#[test]
fn property_poll_never_exceeds_attempt_budget() {
    proptest!(|(max_attempts in 0u32..20, ready_at in prop::option::of(1u32..25))| {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(max_attempts, Duration::ZERO);

        let outcome = runtime().block_on(poll_until(policy, "test", || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match ready_at {
                    Some(at) if call >= at => Ok::<_, String>(Check::Ready(call)),
                    _ => Ok(Check::Pending),
                }
            }
        }));

        let made = calls.load(Ordering::SeqCst);
        prop_assert!(made <= max_attempts);
        match ready_at {
            Some(at) if at <= max_attempts => {
                prop_assert_eq!(outcome, PollOutcome::Ready { value: at, attempts: at });
                prop_assert_eq!(made, at);
            }
            _ => {
                prop_assert_eq!(outcome, PollOutcome::TimedOut { attempts: max_attempts });
                prop_assert_eq!(made, max_attempts);
            }
        }
    });
}

// Check errors are retried like pending answers
#[test]
fn property_check_errors_count_as_pending() {
    proptest!(|(max_attempts in 1u32..15)| {
        let policy = PollPolicy::new(max_attempts, Duration::ZERO);
        let outcome = runtime().block_on(poll_until(policy, "test", || async {
            Err::<Check<()>, _>("service unavailable")
        }));
        prop_assert_eq!(outcome, PollOutcome::TimedOut { attempts: max_attempts });
    });
}

#[test]
fn property_quote_name_wraps_plain_names() {
    proptest!(|(name in "[A-Za-z_][A-Za-z0-9_ .-]{0,30}")| {
        prop_assert_eq!(commands::quote_name(&name).unwrap(), format!("['{}']", name));
    });
}

#[test]
fn property_quote_name_rejects_breaking_characters() {
    proptest!(|(
        prefix in "[A-Za-z0-9_]{0,10}",
        bad in prop::sample::select(vec!['\'', ']', '\n']),
        suffix in "[A-Za-z0-9_]{0,10}"
    )| {
        let name = format!("{}{}{}", prefix, bad, suffix);
        prop_assert!(commands::quote_name(&name).is_err());
    });
}

// Escaped literals never contain an unescaped quote
#[test]
fn property_string_literal_escapes_quotes() {
    proptest!(|(value in "\\PC{0,40}")| {
        let literal = commands::string_literal(&value);
        let inner = &literal[1..literal.len() - 1];
        let mut escaped = false;
        for c in inner.chars() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else {
                prop_assert_ne!(c, '\'');
            }
        }
        prop_assert!(!escaped);
    });
}
