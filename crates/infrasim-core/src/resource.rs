//! Resource algebra: fixed-dimension vectors of decimal resource quantities.
//!
//! Every quantity in the kernel is a [`rust_decimal::Decimal`] so that
//! thousands of ticks of stock arithmetic never accumulate binary
//! floating-point drift. Equality is exact decimal comparison.
//!
//! All operations are pure and total: arithmetic saturates instead of
//! panicking on overflow, and every vector has the same dimension
//! ([`RESOURCE_COUNT`]) and ordering (the declaration order of [`Resource`]).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Simulation time and durations. Decimal so that fractional timesteps are
/// exact.
pub type Time = Decimal;

/// Number of resource types tracked by every [`ResourceVector`].
pub const RESOURCE_COUNT: usize = 6;

// ---------------------------------------------------------------------------
// Resource catalog
// ---------------------------------------------------------------------------

/// The resource types exchanged between infrastructure elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resource {
    People,
    Water,
    Electricity,
    Oil,
    /// Underground reserves (aquifers, oil fields) drawn down by retrieval.
    Reserves,
    Currency,
}

impl Resource {
    /// All resources in vector order.
    pub const ALL: [Resource; RESOURCE_COUNT] = [
        Resource::People,
        Resource::Water,
        Resource::Electricity,
        Resource::Oil,
        Resource::Reserves,
        Resource::Currency,
    ];

    /// Position of this resource within a [`ResourceVector`].
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Resource::People => "people",
            Resource::Water => "water",
            Resource::Electricity => "electricity",
            Resource::Oil => "oil",
            Resource::Reserves => "reserves",
            Resource::Currency => "currency",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// ResourceVector
// ---------------------------------------------------------------------------

/// An immutable vector holding one signed decimal quantity per [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceVector([Decimal; RESOURCE_COUNT]);

impl ResourceVector {
    /// The zero vector.
    pub const ZERO: ResourceVector = ResourceVector([Decimal::ZERO; RESOURCE_COUNT]);

    pub fn zero() -> Self {
        Self::ZERO
    }

    /// A vector with a single non-zero component.
    pub fn of(resource: Resource, amount: Decimal) -> Self {
        Self::ZERO.with(resource, amount)
    }

    /// Build a vector from `(resource, amount)` pairs. Repeated resources
    /// accumulate.
    pub fn from_pairs(pairs: &[(Resource, Decimal)]) -> Self {
        let mut v = Self::ZERO;
        for &(resource, amount) in pairs {
            let i = resource.index();
            v.0[i] = v.0[i].saturating_add(amount);
        }
        v
    }

    #[inline]
    pub fn get(&self, resource: Resource) -> Decimal {
        self.0[resource.index()]
    }

    /// Copy of this vector with one component replaced.
    #[inline]
    pub fn with(mut self, resource: Resource, amount: Decimal) -> Self {
        self.0[resource.index()] = amount;
        self
    }

    /// Iterate `(resource, amount)` in vector order.
    pub fn components(&self) -> impl Iterator<Item = (Resource, Decimal)> + '_ {
        Resource::ALL.iter().map(move |&r| (r, self.get(r)))
    }

    /// Component-wise sum.
    pub fn add(self, other: Self) -> Self {
        self.zip_with(other, Decimal::saturating_add)
    }

    /// Component-wise difference.
    pub fn subtract(self, other: Self) -> Self {
        self.zip_with(other, Decimal::saturating_sub)
    }

    /// Scale every component.
    pub fn multiply(self, scalar: Decimal) -> Self {
        self.map(|x| x.saturating_mul(scalar))
    }

    /// Divide every component. Division by zero yields the zero vector.
    pub fn divide(self, divisor: Decimal) -> Self {
        self.map(|x| x.checked_div(divisor).unwrap_or(Decimal::ZERO))
    }

    /// Reinterpret the `from` component as `factor` units of `to` per unit.
    ///
    /// The `from` component becomes zero and `to` gains `from * factor`.
    /// All other components are unchanged.
    pub fn swap(self, from: Resource, to: Resource, factor: Decimal) -> Self {
        let moved = self.get(from).saturating_mul(factor);
        let cleared = self.with(from, Decimal::ZERO);
        let target = cleared.get(to).saturating_add(moved);
        cleared.with(to, target)
    }

    /// Apply a conversion matrix, producing a new vector of converted
    /// quantities (the original components are not carried over).
    pub fn transform(self, matrix: &ConversionMatrix) -> Self {
        matrix.apply(self)
    }

    /// Clamp every negative component to zero.
    pub fn truncate_positive(self) -> Self {
        self.map(|x| x.max(Decimal::ZERO))
    }

    /// Component-wise minimum.
    pub fn min(self, other: Self) -> Self {
        self.zip_with(other, |a, b| a.min(b))
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        self.zip_with(other, |a, b| a.max(b))
    }

    /// Keep only the listed components; all others become zero.
    pub fn restrict(self, resources: &[Resource]) -> Self {
        let mut out = Self::ZERO;
        for &r in resources {
            out.0[r.index()] = self.get(r);
        }
        out
    }

    /// Whether any component is strictly positive.
    pub fn has_positive(&self) -> bool {
        self.0.iter().any(|x| x.is_sign_positive() && !x.is_zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|x| x.is_zero())
    }

    pub fn is_non_negative(&self) -> bool {
        self.0.iter().all(|x| !x.is_sign_negative() || x.is_zero())
    }

    /// Sum of a slice of vectors.
    pub fn total(vectors: &[ResourceVector]) -> Self {
        vectors.iter().copied().fold(Self::ZERO, Self::add)
    }

    fn map(self, f: impl Fn(Decimal) -> Decimal) -> Self {
        let mut out = self.0;
        for x in &mut out {
            *x = f(*x);
        }
        Self(out)
    }

    fn zip_with(self, other: Self, f: impl Fn(Decimal, Decimal) -> Decimal) -> Self {
        let mut out = self.0;
        for (x, y) in out.iter_mut().zip(other.0) {
            *x = f(*x, y);
        }
        Self(out)
    }
}

impl std::ops::Add for ResourceVector {
    type Output = ResourceVector;
    fn add(self, rhs: Self) -> Self::Output {
        ResourceVector::add(self, rhs)
    }
}

impl std::ops::Sub for ResourceVector {
    type Output = ResourceVector;
    fn sub(self, rhs: Self) -> Self::Output {
        self.subtract(rhs)
    }
}

impl std::ops::Mul<Decimal> for ResourceVector {
    type Output = ResourceVector;
    fn mul(self, rhs: Decimal) -> Self::Output {
        self.multiply(rhs)
    }
}

impl std::ops::Neg for ResourceVector {
    type Output = ResourceVector;
    fn neg(self) -> Self::Output {
        self.map(|x| -x)
    }
}

impl std::ops::AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = ResourceVector::add(*self, rhs);
    }
}

impl std::ops::SubAssign for ResourceVector {
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.subtract(rhs);
    }
}

impl std::iter::Sum for ResourceVector {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ResourceVector::ZERO, ResourceVector::add)
    }
}

impl std::fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        for (resource, amount) in self.components() {
            if amount.is_zero() {
                continue;
            }
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{resource}={amount}")?;
            first = false;
        }
        f.write_str("]")
    }
}

// ---------------------------------------------------------------------------
// Conversion matrix
// ---------------------------------------------------------------------------

/// One entry of a [`ConversionMatrix`]: each unit of `from` maps to `factor`
/// units of `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub from: Resource,
    pub to: Resource,
    pub factor: Decimal,
}

/// Sparse transformation ratios, e.g. "0.5 oil consumed per unit of
/// electricity produced".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionMatrix {
    entries: Vec<Conversion>,
}

impl ConversionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: add an entry.
    pub fn with(mut self, from: Resource, to: Resource, factor: Decimal) -> Self {
        self.entries.push(Conversion { from, to, factor });
        self
    }

    pub fn entries(&self) -> &[Conversion] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert `input` into the resources this matrix maps it to.
    pub fn apply(&self, input: ResourceVector) -> ResourceVector {
        self.entries.iter().fold(ResourceVector::ZERO, |acc, c| {
            let converted = ResourceVector::of(c.from, input.get(c.from)).swap(c.from, c.to, c.factor);
            acc.add(converted)
        })
    }
}
