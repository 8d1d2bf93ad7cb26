use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use shared::domain::SwitchId;

/// Relay access for one device. Reads return the position currently driving
/// the load, which a person at the wall can change at any time.
pub trait SwitchHardware: Send {
    fn read(&mut self, switch_id: &SwitchId) -> bool;
    fn drive(&mut self, switch_id: &SwitchId, on: bool);

    /// Level of a momentary push button wired next to the relay.
    fn pressed(&mut self, _switch_id: &SwitchId) -> bool {
        false
    }
}

/// In-process relay bank. Clones share the same relays, so a test or the
/// simulator binary can flip a switch "by hand" while the agent owns another
/// handle.
#[derive(Clone, Default)]
pub struct SimulatedHardware {
    relays: Arc<Mutex<HashMap<SwitchId, bool>>>,
    buttons: Arc<Mutex<HashMap<SwitchId, bool>>>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_switches<'a>(switch_ids: impl IntoIterator<Item = &'a SwitchId>) -> Self {
        let hardware = Self::new();
        {
            let mut relays = hardware.relays();
            for switch_id in switch_ids {
                relays.insert(switch_id.clone(), false);
            }
        }
        hardware
    }

    /// Manual toggle at the wall.
    pub fn flip(&self, switch_id: &SwitchId) -> bool {
        let mut relays = self.relays();
        let position = relays.entry(switch_id.clone()).or_insert(false);
        *position = !*position;
        *position
    }

    pub fn set(&self, switch_id: &SwitchId, on: bool) {
        self.relays().insert(switch_id.clone(), on);
    }

    pub fn position(&self, switch_id: &SwitchId) -> bool {
        self.relays().get(switch_id).copied().unwrap_or(false)
    }

    /// Holds the push button down until [`release`](Self::release).
    pub fn press(&self, switch_id: &SwitchId) {
        lock(&self.buttons).insert(switch_id.clone(), true);
    }

    pub fn release(&self, switch_id: &SwitchId) {
        lock(&self.buttons).insert(switch_id.clone(), false);
    }

    fn relays(&self) -> MutexGuard<'_, HashMap<SwitchId, bool>> {
        lock(&self.relays)
    }
}

fn lock(map: &Mutex<HashMap<SwitchId, bool>>) -> MutexGuard<'_, HashMap<SwitchId, bool>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SwitchHardware for SimulatedHardware {
    fn read(&mut self, switch_id: &SwitchId) -> bool {
        self.position(switch_id)
    }

    fn drive(&mut self, switch_id: &SwitchId, on: bool) {
        self.set(switch_id, on);
    }

    fn pressed(&mut self, switch_id: &SwitchId) -> bool {
        lock(&self.buttons).get(switch_id).copied().unwrap_or(false)
    }
}
