//! End-to-end tests: a guest framework against a mock server partition.

#[cfg(test)]
mod native_e2e;

#[cfg(test)]
mod oob_e2e;
