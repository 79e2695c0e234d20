//! Core data model for claims and hints.

/// Separator between the base candidate and the source in a hint key.
///
/// ASCII unit separator; it never appears in masked output.
pub const SEP: char = '\u{001F}';

/// Wire value of an absent iteration hint.
pub const NO_HINT: i32 = -1;

/// A request to bind `target` to `source` within one repository.
///
/// `conflict` carries the iteration-0 candidate for `source` and is only
/// present on retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub source: String,
    pub target: String,
    pub conflict: Option<String>,
    pub iteration: u32,
}

impl ClaimRequest {
    /// First attempt for `source`: the canonical candidate, no conflict.
    pub fn initial(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            conflict: None,
            iteration: 0,
        }
    }

    /// A retry at `iteration`, filed under the original candidate `conflict`.
    pub fn retry(
        source: impl Into<String>,
        target: impl Into<String>,
        conflict: impl Into<String>,
        iteration: u32,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            conflict: Some(conflict.into()),
            iteration,
        }
    }

    /// The string whose shard holds this request's hint.
    pub fn hint_base(&self) -> &str {
        self.conflict.as_deref().unwrap_or(&self.target)
    }

    /// Key under which this request's resolution is memoized.
    pub fn resolution_key(&self) -> String {
        resolution_key(self.hint_base(), &self.source)
    }
}

/// Result of one claim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResponse {
    /// The target is bound to the requesting source.
    Linked,
    /// The target belongs to another source. `hint` is the remembered
    /// iteration that resolved this exact collision before, if any.
    Rejected { hint: Option<u32> },
}

impl ClaimResponse {
    pub fn is_linked(&self) -> bool {
        matches!(self, ClaimResponse::Linked)
    }

    /// Hint as carried on the wire: `0` when linked, [`NO_HINT`] when unknown.
    pub fn iteration_hint(&self) -> i32 {
        match self {
            ClaimResponse::Linked => 0,
            ClaimResponse::Rejected { hint: Some(iteration) } => {
                i32::try_from(*iteration).unwrap_or(i32::MAX)
            }
            ClaimResponse::Rejected { hint: None } => NO_HINT,
        }
    }

    /// Rebuild a response from its wire fields.
    pub fn from_wire(linked: bool, iteration_hint: i32) -> Self {
        if linked {
            ClaimResponse::Linked
        } else {
            ClaimResponse::Rejected {
                hint: u32::try_from(iteration_hint).ok(),
            }
        }
    }
}

/// Outcome of a claim against a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The target was unclaimed or already belonged to this source.
    OwnedBySelf,
    /// The target belongs to a different source.
    OwnedByOther,
}

pub fn resolution_key(base: &str, source: &str) -> String {
    let mut key = String::with_capacity(base.len() + SEP.len_utf8() + source.len());
    key.push_str(base);
    key.push(SEP);
    key.push_str(source);
    key
}
