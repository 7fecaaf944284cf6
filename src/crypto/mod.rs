//! Cipher primitives used by the container and fulfillment layers
//!
//! These are deliberately small wrappers over the `aes` and `rsa` crates:
//! CBC chaining with an explicit block loop, PKCS#7 padding checks, two
//! RSA key-wrap schemes, and PSS request signing.

pub mod aes;
pub mod padding;
pub mod rsa;
