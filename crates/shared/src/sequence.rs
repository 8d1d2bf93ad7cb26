/// Receiver-side duplicate filter for one direction of a link.
///
/// Envelopes at or below the highest sequence already accepted are
/// retransmissions and are dropped.
#[derive(Debug, Clone, Default)]
pub struct SequenceWindow {
    highest: Option<u64>,
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, sequence: u64) -> bool {
        match self.highest {
            Some(highest) if sequence <= highest => false,
            _ => {
                self.highest = Some(sequence);
                true
            }
        }
    }

    /// Accepts a `hello`. A hello that does not advance the window means the
    /// peer restarted its counter, so the window restarts from it.
    pub fn accept_hello(&mut self, sequence: u64) -> bool {
        let restarted = self.highest.is_some_and(|highest| sequence <= highest);
        self.highest = Some(sequence);
        restarted
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}
