pub mod lock_renewal;

pub use lock_renewal::LockRenewal;
