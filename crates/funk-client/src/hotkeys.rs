//! Global hotkey routing.
//!
//! A pure, edge-triggered router maps configured bindings (keyboard keys
//! or mouse1..mouse5) to PTT and quick-switch actions; a background rdev
//! listener feeds it raw input events. Keys are not consumed — they still
//! reach other applications.

use tokio::sync::mpsc;
use tracing::{error, info};

/// A configured input binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Keyboard key by lowercase name ("f7", "space", "a", "5").
    Key(String),
    /// Mouse button 1–5.
    Mouse(u8),
}

/// Parse a binding name from the settings file.
pub fn parse_binding(name: &str) -> Option<Binding> {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    if let Some(digit) = name.strip_prefix("mouse") {
        let n: u8 = digit.parse().ok()?;
        return (1..=5).contains(&n).then_some(Binding::Mouse(n));
    }
    Some(Binding::Key(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    PrimaryPtt = 0,
    SecondaryPtt = 1,
    QuickSwitchA = 2,
    QuickSwitchB = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEvent {
    Pressed(HotkeyAction),
    Released(HotkeyAction),
}

/// Edge-triggered binding → action router. Auto-repeat and duplicate
/// press/release events collapse into single edges.
pub struct HotkeyRouter {
    bindings: Vec<(Binding, HotkeyAction)>,
    held: [bool; 4],
}

impl HotkeyRouter {
    pub fn new(
        primary: Binding,
        secondary: Binding,
        quick_a: Option<Binding>,
        quick_b: Option<Binding>,
    ) -> Self {
        let mut bindings = vec![
            (primary, HotkeyAction::PrimaryPtt),
            (secondary, HotkeyAction::SecondaryPtt),
        ];
        if let Some(binding) = quick_a {
            bindings.push((binding, HotkeyAction::QuickSwitchA));
        }
        if let Some(binding) = quick_b {
            bindings.push((binding, HotkeyAction::QuickSwitchB));
        }
        Self {
            bindings,
            held: [false; 4],
        }
    }

    /// Feed one raw input edge; returns a routed event on state change.
    pub fn input(&mut self, input: &Binding, pressed: bool) -> Option<RouterEvent> {
        let action = self
            .bindings
            .iter()
            .find(|(binding, _)| binding == input)
            .map(|&(_, action)| action)?;
        let slot = &mut self.held[action as usize];

        if pressed && !*slot {
            *slot = true;
            Some(RouterEvent::Pressed(action))
        } else if !pressed && *slot {
            *slot = false;
            Some(RouterEvent::Released(action))
        } else {
            None
        }
    }
}

/// Spawn the global listener thread. Routed events arrive on `events`.
pub fn spawn_listener(mut router: HotkeyRouter, events: mpsc::Sender<RouterEvent>) {
    std::thread::spawn(move || {
        info!("global hotkey listener started");
        let callback = move |event: rdev::Event| {
            let (binding, pressed) = match event.event_type {
                rdev::EventType::KeyPress(key) => (key_binding(key), true),
                rdev::EventType::KeyRelease(key) => (key_binding(key), false),
                rdev::EventType::ButtonPress(button) => (button_binding(button), true),
                rdev::EventType::ButtonRelease(button) => (button_binding(button), false),
                _ => return,
            };
            if let Some(binding) = binding {
                if let Some(routed) = router.input(&binding, pressed) {
                    // Receiver gone means shutdown; nothing to do here.
                    let _ = events.blocking_send(routed);
                }
            }
        };
        if let Err(e) = rdev::listen(callback) {
            error!("global hotkey listener failed: {:?}", e);
        }
    });
}

fn key_binding(key: rdev::Key) -> Option<Binding> {
    key_name(key).map(|name| Binding::Key(name.to_owned()))
}

fn key_name(key: rdev::Key) -> Option<&'static str> {
    use rdev::Key;
    Some(match key {
        Key::F1 => "f1",
        Key::F2 => "f2",
        Key::F3 => "f3",
        Key::F4 => "f4",
        Key::F5 => "f5",
        Key::F6 => "f6",
        Key::F7 => "f7",
        Key::F8 => "f8",
        Key::F9 => "f9",
        Key::F10 => "f10",
        Key::F11 => "f11",
        Key::F12 => "f12",
        Key::Space => "space",
        Key::Num1 => "1",
        Key::Num2 => "2",
        Key::Num3 => "3",
        Key::Num4 => "4",
        Key::Num5 => "5",
        Key::Num6 => "6",
        Key::Num7 => "7",
        Key::Num8 => "8",
        Key::Num9 => "9",
        Key::Num0 => "0",
        Key::KeyA => "a",
        Key::KeyB => "b",
        Key::KeyC => "c",
        Key::KeyD => "d",
        Key::KeyE => "e",
        Key::KeyF => "f",
        Key::KeyG => "g",
        Key::KeyH => "h",
        Key::KeyI => "i",
        Key::KeyJ => "j",
        Key::KeyK => "k",
        Key::KeyL => "l",
        Key::KeyM => "m",
        Key::KeyN => "n",
        Key::KeyO => "o",
        Key::KeyP => "p",
        Key::KeyQ => "q",
        Key::KeyR => "r",
        Key::KeyS => "s",
        Key::KeyT => "t",
        Key::KeyU => "u",
        Key::KeyV => "v",
        Key::KeyW => "w",
        Key::KeyX => "x",
        Key::KeyY => "y",
        Key::KeyZ => "z",
        _ => return None,
    })
}

fn button_binding(button: rdev::Button) -> Option<Binding> {
    use rdev::Button;
    Some(match button {
        Button::Left => Binding::Mouse(1),
        Button::Right => Binding::Mouse(2),
        Button::Middle => Binding::Mouse(3),
        // X11 reports the side buttons as 8 and 9.
        Button::Unknown(8) => Binding::Mouse(4),
        Button::Unknown(9) => Binding::Mouse(5),
        _ => return None,
    })
}
