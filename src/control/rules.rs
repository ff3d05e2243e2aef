//! Routing rules: matching criteria, actions, and specificity ordering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::control::extractor::Features;

/// What to do with a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    ProxyToH1,
    SendToH2,
    Throttle,
    Deprecate,
}

impl Action {
    /// Wire name, as carried in the `X-Hailo-Route` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ProxyToH1 => "H1",
            Action::SendToH2 => "H2",
            Action::Throttle => "Throttle",
            Action::Deprecate => "Deprecate",
        }
    }
}

impl From<Action> for u8 {
    fn from(a: Action) -> u8 {
        match a {
            Action::ProxyToH1 => 1,
            Action::SendToH2 => 2,
            Action::Throttle => 3,
            Action::Deprecate => 4,
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Action::ProxyToH1),
            2 => Ok(Action::SendToH2),
            3 => Ok(Action::Throttle),
            4 => Ok(Action::Deprecate),
            other => Err(format!("unknown action {other}")),
        }
    }
}

/// How to sample requests for proportional matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Sampler {
    /// Sample completely randomly.
    #[default]
    Random,
    /// Sample by the `customer` request parameter.
    Customer,
    /// Sample by the `driver` request parameter.
    Driver,
    /// Sample by the `device` request parameter.
    Device,
    /// Sample by the extracted session ID.
    Session,
}

impl From<Sampler> for u8 {
    fn from(s: Sampler) -> u8 {
        match s {
            Sampler::Random => 0,
            Sampler::Customer => 1,
            Sampler::Driver => 2,
            Sampler::Device => 3,
            Sampler::Session => 4,
        }
    }
}

impl TryFrom<u8> for Sampler {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Sampler::Random),
            1 => Ok(Sampler::Customer),
            2 => Ok(Sampler::Driver),
            3 => Ok(Sampler::Device),
            4 => Ok(Sampler::Session),
            other => Err(format!("unknown sampler {other}")),
        }
    }
}

/// Response payload attached to rules that synthesise a response
/// (throttle and deprecate).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(rename = "httpStatus", skip_serializing_if = "is_zero_u16")]
    pub http_status: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Matching criteria for an HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Match {
    /// City code allow-list as CSV, worked out from the hostname or an
    /// explicit `city`/`hob` parameter. Wire name kept for config
    /// compatibility.
    #[serde(rename = "regulatoryArea", skip_serializing_if = "String::is_empty")]
    pub hob: String,
    /// Pathname prefix, like `/v1/foo/bar`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// "customer" or "driver", worked out from the hostname.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    /// Sampling proportion from 0 to 1.
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub proportion: f32,
    /// How to sample.
    #[serde(skip_serializing_if = "is_random")]
    pub sampler: Sampler,
}

/// Some matching criteria plus an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matcher: Option<Match>,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub weight: i64,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

fn is_random(s: &Sampler) -> bool {
    *s == Sampler::Random
}

impl Rule {
    /// A rule with just an action, used for forced routes.
    pub fn for_action(action: Action) -> Self {
        Self {
            matcher: None,
            action,
            payload: None,
            weight: 0,
        }
    }

    /// Tests if this rule matches a request, wrapped with a feature extractor.
    pub fn matches(&self, features: &mut dyn Features) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.matches(features))
    }

    /// A number that tells us how specific this rule is, in a similar vein
    /// to CSS. The most specific rules are checked first.
    pub fn specificity(&self) -> i64 {
        let Some(m) = &self.matcher else { return 0 };
        let mut s = 0;
        if !m.hob.is_empty() {
            s += 5;
        }
        if !m.source.is_empty() {
            s += 5;
        }
        if !m.path.is_empty() {
            s += 10;
        }
        s
    }

    /// A deterministic unique ID for a rule: the hash of its canonical
    /// serialisation. Used as a map key, never for ordering.
    pub fn id(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", fnv64(&bytes))
    }
}

/// Sort rules into matching order: weight descending, then specificity
/// descending.
pub fn sort_rules(rules: BTreeMap<String, Rule>) -> Vec<Rule> {
    let mut sorted: Vec<Rule> = rules.into_values().collect();
    sorted.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then(b.specificity().cmp(&a.specificity()))
    });
    sorted
}

impl Match {
    /// Tests if these criteria match a request. Every set field must be
    /// satisfied, and sampling must pass.
    pub fn matches(&self, features: &mut dyn Features) -> bool {
        // check path first (easiest)
        if !self.path.is_empty() && !features.path().starts_with(&self.path) {
            return false;
        }

        // check source, since we don't have to dig into the request
        if !self.source.is_empty() && features.source() != self.source {
            return false;
        }

        if !self.hob.is_empty() && !within_csv(&self.hob, &features.hob()) {
            return false;
        }

        self.sample(features)
    }

    /// Calculates if we should allow this request based on sampling.
    fn sample(&self, features: &mut dyn Features) -> bool {
        match self.sampler {
            Sampler::Customer => hash_sample(&features.value("customer"), self.proportion),
            Sampler::Driver => hash_sample(&features.value("driver"), self.proportion),
            Sampler::Device => hash_sample(&features.value("device"), self.proportion),
            Sampler::Session => hash_sample(&features.value("session_id"), self.proportion),
            Sampler::Random => rand::random::<f32>() <= self.proportion,
        }
    }
}

/// Hashes `v` into one of 1,000,000 buckets and decides whether the value
/// falls within the sampled proportion. Deterministic, so identical keys hit
/// the same bucket on every instance.
pub fn hash_sample(v: &str, proportion: f32) -> bool {
    // If blank we ALWAYS sample: we can't fairly calculate chance with no
    // value to go on, and this sampling mostly guards throttle rules where
    // the safe default is to match.
    if v.is_empty() {
        return true;
    }
    // If 0 we know we can't match and can skip hashing
    if proportion <= 0.0 {
        return false;
    }
    let bucket = fnv64(v.as_bytes()) % 1_000_000;
    bucket <= (proportion * 1_000_000.0) as u64
}

/// 64-bit FNV-1. The exact variant is load-bearing: sampling decisions must
/// agree across instances and with historically recorded bucket counts.
pub(crate) fn fnv64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x1000_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash = hash.wrapping_mul(PRIME);
        hash ^= u64::from(b);
    }
    hash
}

/// Tests if some value is within a CSV of possible values.
fn within_csv(csv: &str, test: &str) -> bool {
    csv.split(',').any(|v| v == test)
}
