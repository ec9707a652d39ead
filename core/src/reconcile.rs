/// Reconciliation engine
///
/// Pure merges of (current messages, incoming data) into a new message list.
/// Every function here takes the latest state by reference and returns a fresh
/// vector, so handlers never write back a stale snapshot. Output is always
/// sorted by `created_at`, ties by `id`, and never holds two entries with the
/// same id.
///
/// Dedup key by path:
///   buyer send        -> server id from the RPC response
///   operator echo     -> client key if echoed, else content + sender + time window
///   foreign push      -> message id
use crate::types::{DeliveryState, Message};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Incoming data, tagged by the path it arrived on
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Confirmed message returned by the send RPC
    BuyerSend(Message),
    /// Server echo of a message this operator sent over the push channel
    OperatorEcho { message: Message, window: Duration },
    /// Any push not originated by this client
    Push(Message),
    /// REST history snapshot for the same scope as `current`
    Snapshot { messages: Vec<Message>, window: Duration },
}

/// What `reconcile_echo` did with an echo
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoOutcome {
    /// A local placeholder was replaced by the authoritative message
    Replaced { local_id: String },
    /// The echo id was already present
    Duplicate,
    /// Nothing matched; appended as a new message
    Appended,
}

fn chronological(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort ascending by `created_at`, ties broken by `id`
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(chronological);
}

/// Entry point used by the views
pub fn merge(current: &[Message], incoming: Incoming) -> Vec<Message> {
    let next = match incoming {
        Incoming::BuyerSend(message) | Incoming::Push(message) => merge_by_id(current, message),
        Incoming::OperatorEcho { message, window } => reconcile_echo(current, message, window).0,
        Incoming::Snapshot { messages, window } => merge_snapshot(current, messages, window),
    };
    debug_assert!(is_sorted(&next));
    debug_assert!(duplicate_ids(&next).is_empty());
    next
}

/// Insert `incoming` unless a message with the same id is present. A present
/// entry that is not yet confirmed is upgraded by a confirmed copy.
pub fn merge_by_id(current: &[Message], incoming: Message) -> Vec<Message> {
    let mut next = current.to_vec();
    match next.iter().position(|m| m.id == incoming.id) {
        Some(idx) => {
            if next[idx].delivery_state != DeliveryState::Confirmed
                && incoming.delivery_state == DeliveryState::Confirmed
            {
                next[idx] = incoming;
            } else {
                debug!("Dropping duplicate message {}", incoming.id);
                return next;
            }
        }
        None => next.push(incoming),
    }
    sort_messages(&mut next);
    next
}

fn within_window(placeholder: &Message, echo: &Message, window: Duration) -> bool {
    let delta_ms = (echo.created_at - placeholder.created_at)
        .num_milliseconds()
        .unsigned_abs();
    Duration::from_millis(delta_ms) <= window
}

fn matches_echo(candidate: &Message, echo: &Message, window: Duration) -> bool {
    if candidate.delivery_state == DeliveryState::Confirmed {
        return false;
    }
    // Exact idempotency key wins when the server echoes it
    if let (Some(local), Some(remote)) = (&candidate.client_key, &echo.client_key) {
        return local == remote;
    }
    candidate.content == echo.content
        && candidate.sender_id == echo.sender_id
        && within_window(candidate, echo, window)
}

/// Match an operator echo against local placeholders and replace the first hit.
pub fn reconcile_echo(
    current: &[Message],
    echo: Message,
    window: Duration,
) -> (Vec<Message>, EchoOutcome) {
    if current.iter().any(|m| m.id == echo.id) {
        return (merge_by_id(current, echo), EchoOutcome::Duplicate);
    }

    let mut next = current.to_vec();
    let hit = next.iter().position(|m| matches_echo(m, &echo, window));
    let outcome = match hit {
        Some(idx) => {
            let local_id = next[idx].id.clone();
            debug!("Echo {} replaces placeholder {}", echo.id, local_id);
            next[idx] = Message {
                delivery_state: DeliveryState::Confirmed,
                ..echo
            };
            EchoOutcome::Replaced { local_id }
        }
        None => {
            next.push(echo);
            EchoOutcome::Appended
        }
    };
    sort_messages(&mut next);
    (next, outcome)
}

/// Fold a REST snapshot into the current list.
///
/// Snapshot entries win over current entries with the same id. Confirmed
/// entries missing from the snapshot are kept (a push can race ahead of the
/// snapshot). Local placeholders survive unless the snapshot already holds
/// their authoritative copy.
pub fn merge_snapshot(current: &[Message], snapshot: Vec<Message>, window: Duration) -> Vec<Message> {
    let mut seen: HashSet<String> = HashSet::with_capacity(snapshot.len() + current.len());
    let mut next: Vec<Message> = Vec::with_capacity(snapshot.len() + current.len());

    for msg in snapshot {
        if seen.insert(msg.id.clone()) {
            next.push(msg);
        }
    }

    let confirmed_len = next.len();
    for msg in current {
        if seen.contains(&msg.id) {
            continue;
        }
        if msg.delivery_state != DeliveryState::Confirmed
            && next[..confirmed_len]
                .iter()
                .any(|server| matches_echo(msg, server, window))
        {
            continue;
        }
        seen.insert(msg.id.clone());
        next.push(msg.clone());
    }

    sort_messages(&mut next);
    next
}

/// Mark a local placeholder as failed
pub fn mark_failed(current: &[Message], local_id: &str) -> Vec<Message> {
    current
        .iter()
        .map(|m| {
            if m.id == local_id && m.is_pending() {
                Message {
                    delivery_state: DeliveryState::Failed,
                    ..m.clone()
                }
            } else {
                m.clone()
            }
        })
        .collect()
}

/// Put a failed placeholder back to pending for a retry
pub fn mark_pending(current: &[Message], local_id: &str) -> Vec<Message> {
    current
        .iter()
        .map(|m| {
            if m.id == local_id && m.delivery_state == DeliveryState::Failed {
                Message {
                    delivery_state: DeliveryState::Pending,
                    ..m.clone()
                }
            } else {
                m.clone()
            }
        })
        .collect()
}

/// Ids of every message present more than once (always empty for lists
/// produced by this module)
pub fn duplicate_ids(messages: &[Message]) -> Vec<String> {
    let mut seen = HashSet::new();
    messages
        .iter()
        .filter(|m| !seen.insert(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect()
}

pub fn is_sorted(messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|w| chronological(&w[0], &w[1]) != Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    const WINDOW: Duration = Duration::from_secs(5);

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn msg(id: &str, sender: &str, content: &str, ms: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: sender.to_string(),
            recipient_id: if sender == "op" { "42" } else { "op" }.to_string(),
            content: content.to_string(),
            created_at: at(ms),
            delivery_state: DeliveryState::Confirmed,
            sender_name: None,
            client_key: None,
        }
    }

    fn placeholder(content: &str, ms: i64) -> Message {
        Message::placeholder("op", "42", content, at(ms))
    }

    fn permutations(items: Vec<usize>) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.clone();
            let head = rest.remove(i);
            for mut tail in permutations(rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_push_dedup_by_id() {
        let current = vec![msg("1", "42", "hi", 0)];
        let next = merge(&current, Incoming::Push(msg("1", "42", "hi", 0)));
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn test_out_of_order_push_is_sorted() {
        let current = vec![msg("b", "42", "second", 2000)];
        let next = merge(&current, Incoming::Push(msg("a", "42", "first", 1000)));
        assert_eq!(next[0].id, "a");
        assert_eq!(next[1].id, "b");
    }

    #[test]
    fn test_equal_timestamps_tie_break_by_id() {
        let current = vec![msg("z", "42", "x", 0)];
        let next = merge(&current, Incoming::Push(msg("m", "42", "y", 0)));
        assert_eq!(next[0].id, "m");
        assert!(is_sorted(&next));
    }

    #[test]
    fn test_echo_replaces_placeholder_within_window() {
        let current = vec![msg("1", "42", "hey", -5000), placeholder("Hello", 0)];
        let echo = msg("srv-9", "op", "Hello", 900);

        let (next, outcome) = reconcile_echo(&current, echo, WINDOW);

        assert!(matches!(outcome, EchoOutcome::Replaced { .. }));
        assert_eq!(next.len(), 2);
        assert_eq!(next[1].id, "srv-9");
        assert_eq!(next[1].delivery_state, DeliveryState::Confirmed);
    }

    #[test]
    fn test_echo_outside_window_is_appended() {
        let current = vec![placeholder("Hello", 0)];
        let (next, outcome) = reconcile_echo(&current, msg("srv-1", "op", "Hello", 6000), WINDOW);
        assert_eq!(outcome, EchoOutcome::Appended);
        assert_eq!(next.len(), 2);
        assert!(next[0].is_pending());
    }

    #[test]
    fn test_echo_matches_only_first_of_two_identical_placeholders() {
        let current = vec![placeholder("ok", 0), placeholder("ok", 100)];
        let (next, _) = reconcile_echo(&current, msg("srv-1", "op", "ok", 50), WINDOW);
        assert_eq!(next.len(), 2);
        assert_eq!(next.iter().filter(|m| m.is_pending()).count(), 1);
    }

    #[test]
    fn test_client_key_beats_heuristic() {
        let first = placeholder("same", 0);
        let second = placeholder("same", 10);
        let mut echo = msg("srv-2", "op", "same", 5);
        echo.client_key = second.client_key.clone();

        let (next, outcome) = reconcile_echo(&[first.clone(), second.clone()], echo, WINDOW);

        assert_eq!(
            outcome,
            EchoOutcome::Replaced {
                local_id: second.id.clone()
            }
        );
        assert!(next.iter().any(|m| m.id == first.id && m.is_pending()));
    }

    #[test]
    fn test_repeated_echo_is_duplicate() {
        let current = vec![placeholder("Hello", 0)];
        let (once, _) = reconcile_echo(&current, msg("srv-1", "op", "Hello", 10), WINDOW);
        let (twice, outcome) = reconcile_echo(&once, msg("srv-1", "op", "Hello", 10), WINDOW);
        assert_eq!(outcome, EchoOutcome::Duplicate);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_failed_placeholder_confirmed_by_late_echo() {
        let p = placeholder("late", 0);
        let failed = mark_failed(&[p.clone()], &p.id);
        assert_eq!(failed[0].delivery_state, DeliveryState::Failed);

        let (next, outcome) = reconcile_echo(&failed, msg("srv-5", "op", "late", 4000), WINDOW);
        assert!(matches!(outcome, EchoOutcome::Replaced { .. }));
        assert_eq!(next[0].delivery_state, DeliveryState::Confirmed);
    }

    #[test]
    fn test_snapshot_keeps_racing_push_and_pending() {
        let pending = placeholder("draft", 500);
        let current = vec![msg("3", "42", "pushed early", 3000), pending.clone()];
        let snapshot = vec![msg("1", "42", "a", 0), msg("2", "op", "b", 1000)];

        let next = merge(
            &current,
            Incoming::Snapshot {
                messages: snapshot,
                window: WINDOW,
            },
        );

        let ids: Vec<_> = next.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", pending.id.as_str(), "2", "3"]);
    }

    #[test]
    fn test_snapshot_drops_placeholder_already_confirmed() {
        let current = vec![placeholder("Hello", 0)];
        let snapshot = vec![msg("srv-1", "op", "Hello", 800)];
        let next = merge_snapshot(&current, snapshot, WINDOW);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "srv-1");
    }

    #[test]
    fn test_snapshot_with_duplicate_ids_is_deduped() {
        let snapshot = vec![msg("1", "42", "a", 0), msg("1", "42", "a", 0)];
        assert_eq!(merge_snapshot(&[], snapshot, WINDOW).len(), 1);
    }

    #[test]
    fn test_any_interleaving_converges() {
        let snapshot = vec![msg("1", "42", "a", 0), msg("2", "op", "b", 1000), msg("3", "42", "c", 2000)];
        let events: Vec<Incoming> = vec![
            Incoming::Snapshot {
                messages: snapshot,
                window: WINDOW,
            },
            Incoming::Push(msg("3", "42", "c", 2000)),
            Incoming::Push(msg("4", "42", "d", 1500)),
            Incoming::Push(msg("5", "42", "e", 2000)),
            Incoming::BuyerSend(msg("2", "op", "b", 1000)),
        ];

        let mut expected: Option<Vec<String>> = None;
        for order in permutations((0..events.len()).collect()) {
            let mut state: Vec<Message> = Vec::new();
            for idx in order {
                state = merge(&state, events[idx].clone());
            }
            assert!(duplicate_ids(&state).is_empty());
            assert!(is_sorted(&state));
            let ids: Vec<String> = state.iter().map(|m| m.id.clone()).collect();
            match &expected {
                Some(prev) => assert_eq!(prev, &ids),
                None => expected = Some(ids),
            }
        }
        assert_eq!(
            expected.unwrap(),
            vec!["1", "2", "4", "3", "5"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_retry_round_trip_of_delivery_state() {
        let p = placeholder("x", 0);
        let failed = mark_failed(&[p.clone()], &p.id);
        let retried = mark_pending(&failed, &p.id);
        assert!(retried[0].is_pending());
        // confirmed messages are never downgraded
        let confirmed = vec![msg("1", "42", "a", 0)];
        assert_eq!(mark_failed(&confirmed, "1")[0].delivery_state, DeliveryState::Confirmed);
    }
}
