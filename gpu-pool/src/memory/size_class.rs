//! Routing of request sizes to size classes.

use crate::config::SizeClass;
use crate::error::{PoolError, PoolResult};

use super::align_up;

/// Ordered size classes plus the alignment requests are rounded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassTable {
    classes: Vec<SizeClass>,
    alignment: u64,
}

impl SizeClassTable {
    /// Create a routing table.
    ///
    /// `classes` must be ascending and end with the overflow class, as
    /// produced by [`PoolConfig::validated`](crate::PoolConfig::validated).
    pub fn new(classes: Vec<SizeClass>, alignment: u64) -> Self {
        debug_assert!(classes.last().is_some_and(SizeClass::is_overflow));
        Self { classes, alignment }
    }

    /// The configured classes.
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the table has no classes.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Alignment requests are rounded to.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Class at `index`.
    pub fn class(&self, index: usize) -> &SizeClass {
        &self.classes[index]
    }

    /// Route a request to the first class whose threshold covers its aligned size.
    ///
    /// Returns the class index and the aligned size.
    pub fn route(&self, size: u64) -> PoolResult<(usize, u64)> {
        if size == 0 {
            return Err(PoolError::InvalidParameter(
                "allocation size cannot be zero".to_string(),
            ));
        }

        let aligned = align_up(size, self.alignment).ok_or_else(|| {
            PoolError::InvalidParameter(format!("allocation size {size} overflows alignment"))
        })?;

        let index = self
            .classes
            .iter()
            .position(|class| class.threshold >= aligned)
            .ok_or_else(|| {
                PoolError::Internal(format!("no size class covers {aligned} bytes"))
            })?;

        Ok((index, aligned))
    }
}
