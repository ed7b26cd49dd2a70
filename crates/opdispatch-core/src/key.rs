//! Backend keys, key sets, and the priority table that orders them.
//!
//! A key names the concern that governs one layer of a call: a concrete
//! execution backend, a lazy value representation that must be materialized,
//! gradient tracking, or ambient interception. Several keys apply to a single
//! call; the engine visits them from highest to lowest priority.
//!
//! The priority order is a configuration table, never derived at runtime.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// A dispatch key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BackendKey {
    /// Host execution.
    #[serde(rename = "CPU")]
    Cpu,
    /// Accelerator execution.
    #[serde(rename = "CUDA")]
    Cuda,
    /// Shape-only execution; meta tensors carry no storage.
    Meta,
    /// Ambient interception: modes and tensor subclasses.
    Python,
    /// Lazily negated views.
    Negative,
    /// Efficient zero tensors that carry no storage.
    ZeroTensor,
    #[serde(rename = "AutogradCPU")]
    AutogradCpu,
    #[serde(rename = "AutogradCUDA")]
    AutogradCuda,
    AutogradMeta,
}

/// Default priority table, lowest priority first.
pub const DEFAULT_KEY_ORDER: [BackendKey; BackendKey::COUNT] = [
    BackendKey::Meta,
    BackendKey::Cuda,
    BackendKey::Cpu,
    BackendKey::Python,
    BackendKey::Negative,
    BackendKey::ZeroTensor,
    BackendKey::AutogradMeta,
    BackendKey::AutogradCuda,
    BackendKey::AutogradCpu,
];

impl BackendKey {
    pub const COUNT: usize = 9;

    pub const ALL: [BackendKey; Self::COUNT] = [
        BackendKey::Cpu,
        BackendKey::Cuda,
        BackendKey::Meta,
        BackendKey::Python,
        BackendKey::Negative,
        BackendKey::ZeroTensor,
        BackendKey::AutogradCpu,
        BackendKey::AutogradCuda,
        BackendKey::AutogradMeta,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Cuda => "CUDA",
            Self::Meta => "Meta",
            Self::Python => "Python",
            Self::Negative => "Negative",
            Self::ZeroTensor => "ZeroTensor",
            Self::AutogradCpu => "AutogradCPU",
            Self::AutogradCuda => "AutogradCUDA",
            Self::AutogradMeta => "AutogradMeta",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    const fn bit(self) -> u16 {
        1 << self.index()
    }

    /// Whether this key selects a concrete execution backend.
    pub const fn is_backend(self) -> bool {
        matches!(self, Self::Cpu | Self::Cuda | Self::Meta)
    }

    /// Whether this key is one of the gradient-tracking keys.
    pub const fn is_autograd(self) -> bool {
        matches!(
            self,
            Self::AutogradCpu | Self::AutogradCuda | Self::AutogradMeta
        )
    }
}

impl std::fmt::Display for BackendKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("unknown dispatch key: {s}"))
    }
}

/// A set of backend keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeySet(u16);

impl KeySet {
    pub const EMPTY: KeySet = KeySet(0);

    pub fn from_keys(keys: &[BackendKey]) -> Self {
        keys.iter().copied().collect()
    }

    pub fn insert(&mut self, key: BackendKey) {
        self.0 |= key.bit();
    }

    pub fn remove(&mut self, key: BackendKey) {
        self.0 &= !key.bit();
    }

    #[must_use]
    pub fn with(mut self, key: BackendKey) -> Self {
        self.insert(key);
        self
    }

    #[must_use]
    pub fn without(mut self, key: BackendKey) -> Self {
        self.remove(key);
        self
    }

    pub fn contains(self, key: BackendKey) -> bool {
        self.0 & key.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub fn union(self, other: KeySet) -> Self {
        KeySet(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: KeySet) -> Self {
        KeySet(self.0 & !other.0)
    }

    /// Keys in declaration order (not priority order).
    pub fn iter(self) -> impl Iterator<Item = BackendKey> {
        BackendKey::ALL
            .into_iter()
            .filter(move |key| self.contains(*key))
    }
}

impl FromIterator<BackendKey> for KeySet {
    fn from_iter<I: IntoIterator<Item = BackendKey>>(iter: I) -> Self {
        let mut set = KeySet::EMPTY;
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl std::fmt::Display for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.iter().map(BackendKey::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Total priority order over every backend key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOrder {
    ascending: Vec<BackendKey>,
    ranks: [usize; BackendKey::COUNT],
}

impl KeyOrder {
    /// Build an order from a table listing every key once, lowest first.
    ///
    /// Ambient interception and every gradient-tracking key must rank above
    /// every concrete backend.
    pub fn from_ascending(keys: &[BackendKey]) -> Result<Self, ConfigError> {
        let mut ranks = [usize::MAX; BackendKey::COUNT];
        for (rank, key) in keys.iter().enumerate() {
            if ranks[key.index()] != usize::MAX {
                return Err(ConfigError::DuplicateKey(*key));
            }
            ranks[key.index()] = rank;
        }
        if let Some(missing) = BackendKey::ALL
            .into_iter()
            .find(|key| ranks[key.index()] == usize::MAX)
        {
            return Err(ConfigError::MissingKey(missing));
        }

        let order = Self {
            ascending: keys.to_vec(),
            ranks,
        };
        for backend in BackendKey::ALL.into_iter().filter(|k| k.is_backend()) {
            let upper_keys = BackendKey::ALL
                .into_iter()
                .filter(|k| *k == BackendKey::Python || k.is_autograd());
            for upper in upper_keys {
                if order.rank(upper) < order.rank(backend) {
                    return Err(ConfigError::Ordering {
                        upper,
                        lower: backend,
                    });
                }
            }
        }
        Ok(order)
    }

    pub fn rank(&self, key: BackendKey) -> usize {
        self.ranks[key.index()]
    }

    /// The table, lowest priority first.
    pub fn ascending(&self) -> &[BackendKey] {
        &self.ascending
    }

    /// Members of `set`, highest priority first.
    pub fn descending(&self, set: KeySet) -> Vec<BackendKey> {
        self.ascending
            .iter()
            .rev()
            .copied()
            .filter(|key| set.contains(*key))
            .collect()
    }

    /// `key` and every key ranked above it.
    pub fn at_or_above(&self, key: BackendKey) -> KeySet {
        let rank = self.rank(key);
        self.ascending[rank..].iter().copied().collect()
    }
}

impl Default for KeyOrder {
    fn default() -> Self {
        let mut ranks = [0; BackendKey::COUNT];
        for (rank, key) in DEFAULT_KEY_ORDER.iter().enumerate() {
            ranks[key.index()] = rank;
        }
        Self {
            ascending: DEFAULT_KEY_ORDER.to_vec(),
            ranks,
        }
    }
}
