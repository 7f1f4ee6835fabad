// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of timer names.
//!
//! A [`TimerName`] is an opaque handle to a descriptor that lives for the rest of
//! the process. Handles compare by their registry-assigned code, so identity checks
//! on the instrumentation hot path never touch the label text.
//!
//! The registry is created lazily on first use through [`TimerNameRegistry::global`]
//! and is never torn down: descriptors are leaked on registration and stay valid until
//! process exit. There is exactly one registry per process, which keeps codes unique.

use std::fmt;
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use fnv::FnvHasher;
use hashbrown::HashMap;
use tracing::trace;
use ustr::{ustr, Ustr};

static REGISTRY: OnceLock<TimerNameRegistry> = OnceLock::new();

struct Descriptor {
    label: Ustr,
    extended: bool,
    special_hash_code: u32,
    extended_variant: OnceLock<TimerName>,
}

/// Interned timer descriptor handle.
#[derive(Clone, Copy)]
pub struct TimerName(&'static Descriptor);

impl TimerName {
    #[must_use]
    pub fn label(&self) -> Ustr {
        self.0.label
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.0.extended
    }

    /// Registry-assigned identity code. Not derived from the label.
    #[must_use]
    pub fn special_hash_code(&self) -> u32 {
        self.0.special_hash_code
    }

    /// Returns the extended variant of this name, registering it on first call.
    ///
    /// An extended name is its own extended variant; a plain name is never derived
    /// from an extended one.
    #[must_use]
    pub fn extended(&self) -> TimerName {
        if self.0.extended {
            return *self;
        }
        *self
            .0
            .extended_variant
            .get_or_init(|| TimerNameRegistry::global().register(self.0.label, true))
    }
}

impl PartialEq for TimerName {
    fn eq(&self, other: &Self) -> bool {
        self.0.special_hash_code == other.0.special_hash_code
    }
}

impl Eq for TimerName {}

impl Hash for TimerName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.special_hash_code.hash(state);
    }
}

impl fmt::Debug for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerName")
            .field("label", &self.0.label)
            .field("extended", &self.0.extended)
            .field("code", &self.0.special_hash_code)
            .finish()
    }
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.label)
    }
}

pub struct TimerNameRegistry {
    names: Mutex<HashMap<(Ustr, bool), TimerName, BuildHasherDefault<FnvHasher>>>,
    next_code: AtomicU32,
}

impl TimerNameRegistry {
    fn new() -> Self {
        Self {
            names: Mutex::new(HashMap::default()),
            next_code: AtomicU32::new(1),
        }
    }

    /// The registry shared by every component in this process.
    pub fn global() -> &'static TimerNameRegistry {
        REGISTRY.get_or_init(TimerNameRegistry::new)
    }

    /// Registers `label` as a plain timer name. Idempotent per label.
    pub fn plain(&self, label: &str) -> TimerName {
        self.register(ustr(label), false)
    }

    fn register(&self, label: Ustr, extended: bool) -> TimerName {
        #[allow(clippy::expect_used)]
        let mut names = self.names.lock().expect("lock poisoned");
        *names.entry((label, extended)).or_insert_with(|| {
            let special_hash_code = self.next_code.fetch_add(1, Ordering::Relaxed);
            trace!(%label, extended, special_hash_code, "registering timer name");
            TimerName(Box::leak(Box::new(Descriptor {
                label,
                extended,
                special_hash_code,
                extended_variant: OnceLock::new(),
            })))
        })
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.names.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shorthand for `TimerNameRegistry::global().plain(label)`.
pub fn timer_name(label: &str) -> TimerName {
    TimerNameRegistry::global().plain(label)
}
