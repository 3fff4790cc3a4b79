//! Contact listener that ends a round on terminal contact

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use super::engine::{ContactFixture, ContactListener};

/// Category reserved for the end-of-round condition
pub const TERMINAL_CATEGORY: u16 = 0x0002;

/// Clears the runner's `running` flag when two terminal fixtures touch.
///
/// Every other pair, sensors included, is left to consumers of the frame log.
pub struct TerminalContactListener {
    running: Arc<AtomicBool>,
}

impl TerminalContactListener {
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self { running }
    }
}

impl ContactListener for TerminalContactListener {
    fn begin_contact(&self, a: &ContactFixture, b: &ContactFixture) {
        if a.filter.category_bits == TERMINAL_CATEGORY && b.filter.category_bits == TERMINAL_CATEGORY
        {
            info!(body_a = a.body, body_b = b.body, "Terminal contact");
            self.running.store(false, Ordering::Release);
        }
    }
}
