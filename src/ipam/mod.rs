//! Virtual address allocation from the configured CIDR ranges.

mod allocator;

pub use allocator::VipAllocator;
