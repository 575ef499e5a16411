use tracing::debug;

use crate::model::EventRecord;

/// One event matched by the scan, tagged with the payload produced from the
/// accumulator state at that point.
#[derive(Debug, Clone)]
pub struct Correlated<R> {
    /// Block-local index of the matched event.
    pub event_index: u32,
    /// Account from the event's first data field.
    pub account: String,
    /// Amount from the event's second data field.
    pub amount: u128,
    pub payload: R,
}

/// Left-to-right single-pass fold over a block's events.
///
/// Events whose `(section, method)` differ from the target are carried over
/// without touching the accumulator. For each match the accumulator advances
/// through `advance(current, account)` and `produce(new, amount)` builds the
/// record payload. Order is load-bearing: a cause event always precedes the
/// reward/slash events it explains, so the scan must not reorder or
/// parallelize.
pub fn correlate<A, R>(
    events: &[EventRecord],
    section: &str,
    method: &str,
    initial: A,
    mut advance: impl FnMut(&A, &str) -> A,
    mut produce: impl FnMut(&A, u128) -> R,
) -> Vec<Correlated<R>> {
    let mut accumulator = initial;
    let mut matched = Vec::new();

    for event in events {
        if event.pallet != section || event.method != method {
            continue;
        }
        let Some(data) = &event.data else {
            debug!(
                index = event.index,
                section, method, "matching event without account/amount fields, skipping"
            );
            continue;
        };

        accumulator = advance(&accumulator, &data.account);
        let payload = produce(&accumulator, data.amount);

        matched.push(Correlated {
            event_index: event.index,
            account: data.account.clone(),
            amount: data.amount,
            payload,
        });
    }

    matched
}
