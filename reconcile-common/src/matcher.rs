use std::collections::{BTreeSet, HashMap};

use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::metrics_consts::MATCH_CANDIDATES;
use crate::record::Identity;
use crate::store::{DocumentStore, StoreError};

/// The two identity predicates of one inbound record, folded into a single filter.
///
/// - name+email: stored `name` and `email` equal the inbound values.
/// - email+phone: stored `email` equals the inbound value and, when the inbound
///   record has a phone, stored `phone` equals it too.
///
/// Both predicates require an email, so a record without one has no filter at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFilter {
    pub email: String,
    /// Set when the name+email predicate is active.
    pub name: Option<String>,
    /// Narrows the email+phone predicate when set.
    pub phone: Option<String>,
}

impl MatchFilter {
    pub fn for_identity(identity: &Identity) -> Option<Self> {
        let email = identity.email.clone()?;
        Some(Self {
            email,
            name: identity.name.clone(),
            phone: identity.phone.clone(),
        })
    }

    pub fn matches(&self, candidate: &Identity) -> bool {
        if candidate.email.as_deref() != Some(self.email.as_str()) {
            return false;
        }

        let name_email = self
            .name
            .as_deref()
            .is_some_and(|name| candidate.name.as_deref() == Some(name));
        let email_phone = match self.phone.as_deref() {
            Some(phone) => candidate.phone.as_deref() == Some(phone),
            None => true,
        };

        name_email || email_phone
    }

    /// All rows that could ever match each other share this key.
    pub fn cluster_key(&self) -> &str {
        &self.email
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResolution {
    NoMatch,
    SingleMatch(String),
    AmbiguousMatch(Vec<String>),
}

impl MatchResolution {
    fn from_candidates(candidates: BTreeSet<String>) -> Self {
        let mut ids: Vec<String> = candidates.into_iter().collect();
        match ids.len() {
            0 => MatchResolution::NoMatch,
            1 => MatchResolution::SingleMatch(ids.remove(0)),
            _ => MatchResolution::AmbiguousMatch(ids),
        }
    }
}

/// Identities touched earlier in the same batch, as they will look once the batch
/// is committed. Shadows the store's view of those entities.
#[derive(Debug, Default)]
pub struct PendingIdentities {
    identities: HashMap<String, Identity>,
}

impl PendingIdentities {
    pub fn record_insert(&mut self, id: &str, identity: &Identity) {
        self.identities.insert(id.to_owned(), identity.clone());
    }

    /// `stored` is the identity the store reported, used when the entity was not
    /// touched by the batch yet.
    pub fn record_update(&mut self, id: &str, stored: Option<&Identity>, identity: &Identity) {
        let pending = self
            .identities
            .entry(id.to_owned())
            .or_insert_with(|| stored.cloned().unwrap_or_default());
        pending.merge(identity);
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.get(id)
    }

    fn matching<'a>(&'a self, filter: &'a MatchFilter) -> impl Iterator<Item = &'a String> + 'a {
        self.identities
            .iter()
            .filter(move |(_, identity)| filter.matches(identity))
            .map(|(id, _)| id)
    }
}

/// Outcome of a match, with the store's identities of the candidates so the caller
/// can keep `PendingIdentities` current.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub resolution: MatchResolution,
    pub stored: HashMap<String, Identity>,
}

pub struct IdentityMatcher<'a, S: ?Sized> {
    store: &'a S,
    timeout: Duration,
}

impl<'a, S: DocumentStore + ?Sized> IdentityMatcher<'a, S> {
    pub fn new(store: &'a S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Resolve `identity` against the store, overlaid with the batch's pending identities.
    pub async fn resolve(
        &self,
        identity: &Identity,
        pending: &PendingIdentities,
    ) -> Result<Resolved, StoreError> {
        let Some(filter) = MatchFilter::for_identity(identity) else {
            return Ok(Resolved {
                resolution: MatchResolution::NoMatch,
                stored: HashMap::new(),
            });
        };

        let found = timeout(self.timeout, self.store.find_matching(&filter)).await??;

        let mut candidates = BTreeSet::new();
        let mut stored = HashMap::new();
        for entity in found {
            // An entity this batch already touched is judged on its pending identity.
            let current = pending.get(&entity.id).unwrap_or(&entity.identity);
            if filter.matches(current) {
                candidates.insert(entity.id.clone());
            }
            stored.insert(entity.id, entity.identity);
        }
        candidates.extend(pending.matching(&filter).cloned());

        metrics::histogram!(MATCH_CANDIDATES).record(candidates.len() as f64);
        debug!(
            email = filter.email.as_str(),
            candidates = candidates.len(),
            "resolved identity"
        );

        Ok(Resolved {
            resolution: MatchResolution::from_candidates(candidates),
            stored,
        })
    }
}
