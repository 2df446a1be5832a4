//! Change-significance throttles for replicated values
//!
//! A throttle remembers the last value that was actually sent (the baseline)
//! and answers whether a candidate value is still close enough to it that
//! re-sending can be skipped.
//!
//! - `BasicThrottle`: exact equality, for discrete values (enums, flags, counters)
//! - `EpsilonThrottle`: squared-distance tolerance, for continuous values
//!   (positions, velocities) where small jitter should not cost bandwidth
//!
//! `within_threshold` returning `true` means "not significant, skip". The
//! baseline only moves through `update_baseline`, which the transport calls
//! after a value has really been sent. Updating it on every tick would let
//! slow drift below epsilon per tick accumulate forever without a send.

use std::marker::PhantomData;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::interest::ids::ReplicaId;
use crate::util::vec3::Vec3;

// ============================================================================
// Default Thresholds
// ============================================================================

/// Position change threshold (world units)
pub const POSITION_EPSILON: f32 = 0.1;

/// Velocity change threshold (units/second)
pub const VELOCITY_EPSILON: f32 = 0.5;

/// Rotation change threshold (radians, ~0.5 degrees)
pub const ROTATION_EPSILON: f32 = 0.01;

// ============================================================================
// Throttle Trait
// ============================================================================

/// Common interface over the throttle variants so transport code can hold
/// either behind one type parameter.
pub trait Throttle<T> {
    /// `true` if `value` is not different enough from the baseline to send.
    fn within_threshold(&self, value: &T) -> bool;

    /// Overwrite the baseline. Call only after `value` was transmitted.
    fn update_baseline(&mut self, value: T);

    fn baseline(&self) -> &T;
}

/// Squared-difference metric used by [`EpsilonThrottle`].
///
/// `Scalar` is the type the squared difference (and therefore epsilon) is
/// expressed in: `f32` for `f32` and `Vec3`, `f64` for `f64`, `u128` for
/// integers so the square of any difference fits.
pub trait ThrottleDelta {
    type Scalar: Copy + PartialOrd + Default + std::fmt::Debug;

    fn delta_sq(&self, other: &Self) -> Self::Scalar;

    /// `epsilon * epsilon` in `Scalar`. Integer squares saturate at
    /// `u128::MAX`, which no `delta_sq` can reach.
    fn square(epsilon: Self::Scalar) -> Self::Scalar;
}

impl ThrottleDelta for f32 {
    type Scalar = f32;

    #[inline]
    fn delta_sq(&self, other: &Self) -> f32 {
        let d = self - other;
        d * d
    }

    #[inline]
    fn square(epsilon: f32) -> f32 {
        epsilon * epsilon
    }
}

impl ThrottleDelta for f64 {
    type Scalar = f64;

    #[inline]
    fn delta_sq(&self, other: &Self) -> f64 {
        let d = self - other;
        d * d
    }

    #[inline]
    fn square(epsilon: f64) -> f64 {
        epsilon * epsilon
    }
}

macro_rules! impl_int_delta {
    ($($t:ty),*) => {
        $(
            impl ThrottleDelta for $t {
                type Scalar = u128;

                #[inline]
                fn delta_sq(&self, other: &Self) -> u128 {
                    let d = self.abs_diff(*other) as u128;
                    d * d
                }

                #[inline]
                fn square(epsilon: u128) -> u128 {
                    epsilon.checked_mul(epsilon).unwrap_or(u128::MAX)
                }
            }
        )*
    };
}

impl_int_delta!(i8, i16, i32, i64, u8, u16, u32, u64);

impl ThrottleDelta for Vec3 {
    type Scalar = f32;

    #[inline]
    fn delta_sq(&self, other: &Self) -> f32 {
        self.distance_sq_to(*other)
    }

    #[inline]
    fn square(epsilon: f32) -> f32 {
        epsilon * epsilon
    }
}

// ============================================================================
// BasicThrottle
// ============================================================================

/// Exact-match throttle: any difference at all is significant.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicThrottle<T> {
    baseline: T,
}

impl<T: PartialEq> BasicThrottle<T> {
    pub fn new(baseline: T) -> Self {
        Self { baseline }
    }

    #[inline]
    pub fn within_threshold(&self, cur: &T) -> bool {
        *cur == self.baseline
    }

    #[inline]
    pub fn update_baseline(&mut self, value: T) {
        self.baseline = value;
    }

    pub fn baseline(&self) -> &T {
        &self.baseline
    }
}

impl<T: Default + PartialEq> Default for BasicThrottle<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: PartialEq> Throttle<T> for BasicThrottle<T> {
    fn within_threshold(&self, value: &T) -> bool {
        BasicThrottle::within_threshold(self, value)
    }

    fn update_baseline(&mut self, value: T) {
        BasicThrottle::update_baseline(self, value)
    }

    fn baseline(&self) -> &T {
        &self.baseline
    }
}

// ============================================================================
// EpsilonThrottle
// ============================================================================

/// Tolerance throttle: significant once the squared difference from the
/// baseline reaches `epsilon²`. The boundary is exclusive, a value exactly
/// `epsilon` away is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct EpsilonThrottle<T: ThrottleDelta> {
    baseline: T,
    /// Always `epsilon * epsilon`, saturating for integer values
    epsilon2: T::Scalar,
}

impl<T: ThrottleDelta> EpsilonThrottle<T> {
    pub fn new(baseline: T, epsilon: T::Scalar) -> Self {
        let mut throttle = Self {
            baseline,
            epsilon2: T::Scalar::default(),
        };
        throttle.set_threshold(epsilon);
        throttle
    }

    #[inline]
    pub fn within_threshold(&self, new_value: &T) -> bool {
        self.baseline.delta_sq(new_value) < self.epsilon2
    }

    #[inline]
    pub fn update_baseline(&mut self, value: T) {
        self.baseline = value;
    }

    /// Set the tolerance. `epsilon` must be non-negative; a negative value is
    /// a caller bug (asserted in debug builds) and behaves as `|epsilon|`.
    pub fn set_threshold(&mut self, epsilon: T::Scalar) {
        if epsilon < T::Scalar::default() {
            warn!("EpsilonThrottle::set_threshold called with negative epsilon {:?}", epsilon);
            debug_assert!(false, "throttle epsilon must be >= 0");
        }
        self.epsilon2 = T::square(epsilon);
    }

    /// Squared tolerance
    pub fn epsilon2(&self) -> T::Scalar {
        self.epsilon2
    }

    pub fn baseline(&self) -> &T {
        &self.baseline
    }
}

impl<T: ThrottleDelta> Throttle<T> for EpsilonThrottle<T> {
    fn within_threshold(&self, value: &T) -> bool {
        EpsilonThrottle::within_threshold(self, value)
    }

    fn update_baseline(&mut self, value: T) {
        EpsilonThrottle::update_baseline(self, value)
    }

    fn baseline(&self) -> &T {
        &self.baseline
    }
}

// ============================================================================
// ThrottleMap
// ============================================================================

/// Identifies one replicated attribute of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThrottleKey {
    pub replica: ReplicaId,
    pub field: u16,
}

impl ThrottleKey {
    pub fn new(replica: ReplicaId, field: u16) -> Self {
        Self { replica, field }
    }
}

/// One throttle per (replica, attribute), created on first send by cloning a
/// prototype so every key shares the same policy unless overridden.
///
/// A key with no throttle has never been sent, so it is always significant.
#[derive(Debug, Clone)]
pub struct ThrottleMap<T, Th> {
    prototype: Th,
    throttles: HashMap<ThrottleKey, Th>,
    _value: PhantomData<fn(T)>,
}

impl<T, Th> ThrottleMap<T, Th>
where
    Th: Throttle<T> + Clone,
{
    pub fn new(prototype: Th) -> Self {
        Self {
            prototype,
            throttles: HashMap::new(),
            _value: PhantomData,
        }
    }

    /// Install a throttle with its own policy for one key
    pub fn insert(&mut self, key: ThrottleKey, throttle: Th) {
        self.throttles.insert(key, throttle);
    }

    pub fn get(&self, key: &ThrottleKey) -> Option<&Th> {
        self.throttles.get(key)
    }

    /// Pure query: should `value` be sent for `key`?
    #[inline]
    pub fn is_significant(&self, key: &ThrottleKey, value: &T) -> bool {
        match self.throttles.get(key) {
            Some(throttle) => !throttle.within_threshold(value),
            None => true,
        }
    }

    /// Record that `value` was transmitted for `key`
    pub fn mark_sent(&mut self, key: ThrottleKey, value: T) {
        match self.throttles.get_mut(&key) {
            Some(throttle) => throttle.update_baseline(value),
            None => {
                let mut throttle = self.prototype.clone();
                throttle.update_baseline(value);
                self.throttles.insert(key, throttle);
            }
        }
    }

    /// Drop all throttles of a destroyed replica
    pub fn remove_replica(&mut self, replica: ReplicaId) -> usize {
        let before = self.throttles.len();
        self.throttles.retain(|key, _| key.replica != replica);
        before - self.throttles.len()
    }

    pub fn len(&self) -> usize {
        self.throttles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }
}
