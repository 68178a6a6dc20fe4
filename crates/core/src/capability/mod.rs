//! Demand-driven scheduling of optional analysis stages.
//!
//! Consumers register what they display through [`SubscriptionHub::subscribe`]
//! and keep the returned [`Subscription`] alive for as long as they need it.
//! Once per hop the producer asks the [`CapabilityScheduler`] for a
//! [`HopPlan`]; stages whose capability is not in the plan are skipped.

use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign, Sub},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub(crate) const CAPABILITY_COUNT: usize = 9;

/// Bitset of derived features a consumer needs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const SPECTROGRAM: Self = Self(1 << 0);
    pub const LINEAR_MAGNITUDES: Self = Self(1 << 1);
    pub const PITCH: Self = Self(1 << 2);
    pub const FORMANTS: Self = Self(1 << 3);
    pub const HARMONICS: Self = Self(1 << 4);
    pub const VOICING: Self = Self(1 << 5);
    pub const WAVEFORM: Self = Self(1 << 6);
    pub const SPECTRAL_FEATURES: Self = Self(1 << 7);
    pub const SPEECH_METRICS: Self = Self(1 << 8);
    pub const ALL: Self = Self((1 << CAPABILITY_COUNT) - 1);

    const NAMES: [(Self, &'static str); CAPABILITY_COUNT] = [
        (Self::SPECTROGRAM, "SPECTROGRAM"),
        (Self::LINEAR_MAGNITUDES, "LINEAR_MAGNITUDES"),
        (Self::PITCH, "PITCH"),
        (Self::FORMANTS, "FORMANTS"),
        (Self::HARMONICS, "HARMONICS"),
        (Self::VOICING, "VOICING"),
        (Self::WAVEFORM, "WAVEFORM"),
        (Self::SPECTRAL_FEATURES, "SPECTRAL_FEATURES"),
        (Self::SPEECH_METRICS, "SPEECH_METRICS"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Adds the stages every requested stage depends on.
    pub fn with_dependencies(self) -> Self {
        let mut closed = self;
        if closed.intersects(Self::SPEECH_METRICS) {
            closed |= Self::VOICING | Self::WAVEFORM;
        }
        if closed.intersects(Self::HARMONICS | Self::VOICING | Self::SPECTRAL_FEATURES) {
            closed |= Self::PITCH;
        }
        closed
    }

    /// Iterates over the individual flags that are set.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::NAMES
            .into_iter()
            .map(|(flag, _)| flag)
            .filter(move |flag| self.contains(*flag))
    }

    /// Bit position of a single flag.
    pub(crate) fn index(self) -> Option<usize> {
        (self.0.count_ones() == 1).then(|| self.0.trailing_zeros() as usize)
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl BitAnd for Capabilities {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Sub for Capabilities {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Capabilities(NONE)");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Capabilities({})", names.join(" | "))
    }
}

/// Lifecycle of a single capability bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    Idle,
    Active,
}

struct Registry {
    counts: [AtomicU32; CAPABILITY_COUNT],
}

impl Registry {
    fn requested(&self) -> Capabilities {
        let bits = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, count)| count.load(Ordering::Acquire) > 0)
            .fold(0u32, |bits, (index, _)| bits | (1 << index));
        Capabilities(bits)
    }

    fn adjust(&self, caps: Capabilities, add: bool) {
        for flag in caps.iter() {
            if let Some(index) = flag.index() {
                if add {
                    self.counts[index].fetch_add(1, Ordering::AcqRel);
                } else {
                    self.counts[index].fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
}

/// Cloneable entry point for consumers on any thread.
#[derive(Clone)]
pub struct SubscriptionHub {
    registry: Arc<Registry>,
}

impl SubscriptionHub {
    /// Registers `caps` until the returned guard is dropped.
    pub fn subscribe(&self, caps: Capabilities) -> Subscription {
        self.registry.adjust(caps, true);
        Subscription {
            registry: self.registry.clone(),
            caps,
        }
    }

    /// Union of all live subscriptions, without dependencies.
    pub fn requested(&self) -> Capabilities {
        self.registry.requested()
    }
}

impl fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("requested", &self.requested())
            .finish()
    }
}

/// Scoped capability request. Dropping it releases the request.
#[must_use = "dropping a subscription immediately releases its capabilities"]
pub struct Subscription {
    registry: Arc<Registry>,
    caps: Capabilities,
}

impl Subscription {
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.adjust(self.caps, false);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("caps", &self.caps).finish()
    }
}

/// Stages to run for one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopPlan {
    pub active: Capabilities,
    /// Went Idle → Active on this hop; their stages start from a clean state.
    pub activated: Capabilities,
    /// Went Active → Idle on this hop.
    pub deactivated: Capabilities,
}

impl HopPlan {
    pub fn runs(&self, caps: Capabilities) -> bool {
        self.active.intersects(caps)
    }

    pub fn activated(&self, caps: Capabilities) -> bool {
        self.activated.intersects(caps)
    }

    pub fn deactivated(&self, caps: Capabilities) -> bool {
        self.deactivated.intersects(caps)
    }
}

/// Producer-side evaluator of the capability union.
pub struct CapabilityScheduler {
    registry: Arc<Registry>,
    active: Capabilities,
}

impl Default for CapabilityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityScheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                counts: Default::default(),
            }),
            active: Capabilities::NONE,
        }
    }

    pub fn hub(&self) -> SubscriptionHub {
        SubscriptionHub {
            registry: self.registry.clone(),
        }
    }

    pub fn subscribe(&self, caps: Capabilities) -> Subscription {
        self.hub().subscribe(caps)
    }

    /// Capabilities active as of the last [`Self::begin_hop`].
    pub fn active(&self) -> Capabilities {
        self.active
    }

    pub fn state(&self, cap: Capabilities) -> CapabilityState {
        if self.active.contains(cap) && !cap.is_empty() {
            CapabilityState::Active
        } else {
            CapabilityState::Idle
        }
    }

    /// Recomputes the union of live subscriptions and reports transitions.
    pub fn begin_hop(&mut self) -> HopPlan {
        let active = self.registry.requested().with_dependencies();
        let plan = HopPlan {
            active,
            activated: active - self.active,
            deactivated: self.active - active,
        };
        if !plan.activated.is_empty() || !plan.deactivated.is_empty() {
            tracing::trace!(
                activated = ?plan.activated,
                deactivated = ?plan.deactivated,
                "capability set changed"
            );
        }
        self.active = active;
        plan
    }

    /// Forgets the current state so every requested stage re-arms on the next
    /// hop.
    pub fn rearm(&mut self) {
        self.active = Capabilities::NONE;
    }
}

impl fmt::Debug for CapabilityScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityScheduler")
            .field("active", &self.active)
            .finish()
    }
}
