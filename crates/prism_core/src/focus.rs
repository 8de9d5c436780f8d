//! Focus layer stack
//!
//! Input focus moves between stacked layers (Game under Menu under Overlay).
//! A layer "has focus" when it is the highest acquired layer; expressions
//! query this through `is_focused`/`if_focused`.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FocusLayer {
    Game,
    Menu,
    Overlay,
}

impl FocusLayer {
    pub fn parse(name: &str) -> Option<FocusLayer> {
        match name {
            "Game" => Some(FocusLayer::Game),
            "Menu" => Some(FocusLayer::Menu),
            "Overlay" => Some(FocusLayer::Overlay),
            _ => None,
        }
    }
}

/// Global focus state, stored per live instance and read under the signal
/// read lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FocusState {
    acquired: Vec<FocusLayer>,
}

impl Default for FocusState {
    fn default() -> Self {
        Self {
            acquired: vec![FocusLayer::Game],
        }
    }
}

impl FocusState {
    /// The highest acquired layer holds primary focus.
    pub fn primary(&self) -> Option<FocusLayer> {
        self.acquired.iter().max().copied()
    }

    pub fn has_focus(&self, layer: FocusLayer) -> bool {
        self.primary() == Some(layer)
    }

    pub fn acquire(&mut self, layer: FocusLayer) {
        if !self.acquired.contains(&layer) {
            self.acquired.push(layer);
        }
    }

    pub fn release(&mut self, layer: FocusLayer) {
        self.acquired.retain(|l| *l != layer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_layer_wins() {
        let mut focus = FocusState::default();
        assert!(focus.has_focus(FocusLayer::Game));

        focus.acquire(FocusLayer::Menu);
        assert!(!focus.has_focus(FocusLayer::Game));
        assert!(focus.has_focus(FocusLayer::Menu));

        focus.acquire(FocusLayer::Overlay);
        assert!(focus.has_focus(FocusLayer::Overlay));

        focus.release(FocusLayer::Overlay);
        focus.release(FocusLayer::Menu);
        assert!(focus.has_focus(FocusLayer::Game));
    }
}
