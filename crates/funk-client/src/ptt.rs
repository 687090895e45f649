//! Push-to-talk control.
//!
//! A PTT press plays the TX-start cue and arms a delayed transmit start;
//! releasing before the delay elapses cancels silently. Quick-switch
//! presses retarget the transmit channel of the already-authenticated
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use funk_protocol::types::{ChannelId, EMERGENCY_CHANNEL};

use crate::hotkeys::{HotkeyAction, RouterEvent};
use crate::session::SessionCommand;

/// Delay between the TX cue and the first transmitted frame.
pub const TX_START_DELAY: Duration = Duration::from_millis(800);

/// Local sound cues; playback itself lives outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    TxStart,
    ChannelSwitch,
}

pub struct PttController {
    commands: mpsc::Sender<SessionCommand>,
    cues: mpsc::Sender<SoundCue>,
    transmitting: Arc<AtomicBool>,
    primary_channel: ChannelId,
    quick_a_target: ChannelId,
    quick_b_target: ChannelId,
    current_channel: ChannelId,
    pending: Option<tokio::task::JoinHandle<()>>,
}

impl PttController {
    pub fn new(
        commands: mpsc::Sender<SessionCommand>,
        cues: mpsc::Sender<SoundCue>,
        primary_channel: ChannelId,
        quick_a_target: ChannelId,
        quick_b_target: ChannelId,
    ) -> Self {
        Self {
            commands,
            cues,
            transmitting: Arc::new(AtomicBool::new(false)),
            primary_channel,
            quick_a_target,
            quick_b_target,
            current_channel: primary_channel,
            pending: None,
        }
    }

    /// Shared flag the capture pipeline polls.
    pub fn transmitting(&self) -> Arc<AtomicBool> {
        self.transmitting.clone()
    }

    /// The channel the next transmission will use.
    pub fn current_channel(&self) -> ChannelId {
        self.current_channel
    }

    /// Settings changed the primary channel.
    pub fn set_primary(&mut self, channel: ChannelId) {
        self.primary_channel = channel;
        self.current_channel = channel;
    }

    pub async fn handle(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Pressed(HotkeyAction::PrimaryPtt) => {
                self.begin_tx(self.primary_channel).await;
            }
            RouterEvent::Pressed(HotkeyAction::SecondaryPtt) => {
                self.begin_tx(EMERGENCY_CHANNEL).await;
            }
            RouterEvent::Released(HotkeyAction::PrimaryPtt)
            | RouterEvent::Released(HotkeyAction::SecondaryPtt) => {
                self.end_tx();
            }
            RouterEvent::Pressed(HotkeyAction::QuickSwitchA) => {
                self.quick_switch(self.quick_a_target).await;
            }
            RouterEvent::Pressed(HotkeyAction::QuickSwitchB) => {
                self.quick_switch(self.quick_b_target).await;
            }
            RouterEvent::Released(HotkeyAction::QuickSwitchA)
            | RouterEvent::Released(HotkeyAction::QuickSwitchB) => {}
        }
    }

    async fn begin_tx(&mut self, channel: ChannelId) {
        let _ = self.cues.send(SoundCue::TxStart).await;
        self.current_channel = channel;

        if let Some(pending) = self.pending.take() {
            pending.abort();
        }

        let commands = self.commands.clone();
        let transmitting = self.transmitting.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(TX_START_DELAY).await;
            let _ = commands
                .send(SessionCommand::SetTransmitChannel(channel))
                .await;
            transmitting.store(true, Ordering::Relaxed);
            info!(channel, "transmitting");
        }));
    }

    fn end_tx(&mut self) {
        if let Some(pending) = self.pending.take() {
            // Released before the delay elapsed: cancel silently.
            pending.abort();
        }
        if self.transmitting.swap(false, Ordering::Relaxed) {
            debug!("transmission stopped");
        }
    }

    async fn quick_switch(&mut self, target: ChannelId) {
        if target == self.current_channel {
            return;
        }
        info!(from = self.current_channel, to = target, "quick channel switch");
        self.current_channel = target;
        let _ = self.cues.send(SoundCue::ChannelSwitch).await;
        let _ = self
            .commands
            .send(SessionCommand::SetTransmitChannel(target))
            .await;
    }
}
