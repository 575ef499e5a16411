use tracing::{debug, warn};

/// Decoded call shapes the flattener recognizes. Everything else on the
/// chain maps to [`Call::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `Staking.payout_stakers(validator_stash, era)`.
    PayoutStakers { validator: String, era: u32 },
    /// `Staking.payout_validator(era)`; the validator is the submitter.
    PayoutValidator { era: u32 },
    /// A utility batch; children in submission order.
    Batch { calls: Vec<Call> },
    /// A proxied call; one level of wrapping around the real call.
    Proxy { inner: Box<Call> },
    /// Any call that cannot cause a reward payout.
    Other,
}

/// Attribution arguments of one primitive reward-causing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutArgs {
    pub validator: String,
    pub era: u32,
}

/// Bound on batch/proxy nesting. Subtrees below this depth contribute
/// nothing instead of recursing further.
pub const MAX_CALL_DEPTH: usize = 16;

/// Flatten a call tree into the ordered attribution arguments of every
/// reward-causing call it contains. `sender` is the address that submitted
/// the enclosing extrinsic and stays the same through batch and proxy
/// unwrapping.
pub fn payout_call_args(call: &Call, sender: Option<&str>) -> Vec<PayoutArgs> {
    flatten(call, sender, 0)
}

fn flatten(call: &Call, sender: Option<&str>, depth: usize) -> Vec<PayoutArgs> {
    if depth > MAX_CALL_DEPTH {
        warn!(depth, "call nesting exceeds depth bound, skipping subtree");
        return Vec::new();
    }

    match call {
        Call::PayoutStakers { validator, era } => vec![PayoutArgs {
            validator: validator.clone(),
            era: *era,
        }],
        Call::PayoutValidator { era } => match sender {
            Some(sender) => vec![PayoutArgs {
                validator: sender.to_string(),
                era: *era,
            }],
            None => {
                debug!("payout_validator without a signed origin, skipping");
                Vec::new()
            }
        },
        Call::Batch { calls } => calls
            .iter()
            .flat_map(|call| flatten(call, sender, depth + 1))
            .collect(),
        Call::Proxy { inner } => flatten(inner, sender, depth + 1),
        Call::Other => Vec::new(),
    }
}
