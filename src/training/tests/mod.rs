//! Test suite for the motion stream training loop
//!
//! Covers the controller end to end (best-score tracking, resume, evaluate
//! only, failure paths) and checkpoint persistence. Component tests live
//! next to their modules.


// Utility modules for testing
pub mod fixtures;
