//! Bonding session state machine
//!
//! Pure decision logic of the Bonding Engine. It consumes link events,
//! sender exits and reconnect timer ticks and answers with the actions the
//! runtime must carry out. No I/O happens here, so every transition can be
//! exercised directly in tests.
//!
//! ```text
//! Idle -> Probing -> ProtocolBonded | NativeMultiLink -> Closed
//!                          |      ^
//!                 zero up  v      | link back, timer fires
//!                       Reconnecting --(attempts exhausted)--> Closed
//! ```

use crate::monitor::LinkEvent;
use rato_io::Backoff;
use rato_protocol::LinkState;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How the session carries media
///
/// Chosen once per (re)start and never switched mid-stream, except for the
/// one-way fallback after the dedicated sender dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondingMode {
    /// A dedicated bonding sender handles the paths
    ProtocolBonded { sender: PathBuf },
    /// Our own sender duplicates every datagram on each up link
    NativeMultiLink,
}

impl BondingMode {
    pub fn label(&self) -> &'static str {
        match self {
            BondingMode::ProtocolBonded { .. } => "protocol-bonded",
            BondingMode::NativeMultiLink => "native-multilink",
        }
    }
}

/// Engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondingState {
    Idle,
    /// Started, waiting for the first usable link
    Probing,
    Bonded(BondingMode),
    Reconnecting { attempt: u32 },
    Closed(CloseReason),
}

/// Lifecycle reported to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    Starting,
    Active,
    /// At least one known link down, at least one still up
    Degraded,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionLifecycle::Starting => "starting",
            SessionLifecycle::Active => "active",
            SessionLifecycle::Degraded => "degraded",
            SessionLifecycle::Reconnecting => "reconnecting",
            SessionLifecycle::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Stopped on request
    Requested,
    /// Every reconnect attempt failed
    ReconnectExhausted,
}

/// Reported link failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    /// One member lost, others still carrying the stream
    TransientLinkLoss { link: String },
    /// No usable link left
    TotalLinkLoss,
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFailure::TransientLinkLoss { link } => write!(f, "transient loss of {}", link),
            LinkFailure::TotalLinkLoss => f.write_str("total link loss"),
        }
    }
}

/// Work the runtime must perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondingAction {
    /// Stop any current transport and start `mode` over `links`
    Launch {
        mode: BondingMode,
        links: Vec<String>,
    },
    AddPath(String),
    RemovePath(String),
    /// Stop the transport and fire the reconnect timer after `delay`
    ScheduleReconnect { delay: Duration, attempt: u32 },
    Close(CloseReason),
}

/// Bonding policy knobs
#[derive(Debug, Clone)]
pub struct BondingPolicy {
    /// Reconnect delays; the last one repeats
    pub reconnect_steps: Vec<Duration>,
    pub max_reconnect_attempts: u32,
}

impl Default for BondingPolicy {
    fn default() -> Self {
        BondingPolicy {
            reconnect_steps: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            max_reconnect_attempts: 12,
        }
    }
}

#[derive(Debug, Clone)]
struct KnownLink {
    name: String,
    state: LinkState,
}

/// Bonding Engine decisions
#[derive(Debug, Clone)]
pub struct BondingStateMachine {
    state: BondingState,
    /// Dedicated sender found at start; cleared by fallback
    dedicated: Option<PathBuf>,
    /// Every link the monitor reported, in discovery order
    links: Vec<KnownLink>,
    /// Paths currently carrying traffic, in order
    members: Vec<String>,
    backoff: Backoff,
    last_failure: Option<LinkFailure>,
}

impl BondingStateMachine {
    pub fn new(policy: BondingPolicy) -> Self {
        let backoff = Backoff::fixed_steps(policy.reconnect_steps)
            .with_max_attempts(policy.max_reconnect_attempts);
        BondingStateMachine {
            state: BondingState::Idle,
            dedicated: None,
            links: Vec::new(),
            members: Vec::new(),
            backoff,
            last_failure: None,
        }
    }

    /// Begin the run
    ///
    /// `dedicated` is the dedicated sender binary when one was found.
    pub fn start(&mut self, dedicated: Option<PathBuf>) -> Vec<BondingAction> {
        if self.state != BondingState::Idle {
            return Vec::new();
        }
        self.dedicated = dedicated;
        self.state = BondingState::Probing;
        self.try_launch()
    }

    /// Feed one monitor event
    pub fn on_link_event(&mut self, event: &LinkEvent) -> Vec<BondingAction> {
        let (name, state) = match event {
            LinkEvent::Discovered(link) | LinkEvent::Sample(link) | LinkEvent::Down(link) => {
                (link.name.as_str(), link.state)
            }
            LinkEvent::Removed(name) => {
                self.links.retain(|l| &l.name != name);
                return self.link_lost(name);
            }
        };

        match self.links.iter_mut().find(|l| l.name == name) {
            Some(known) => known.state = state,
            None => self.links.push(KnownLink {
                name: name.to_string(),
                state,
            }),
        }

        match (&self.state, state.is_usable()) {
            (BondingState::Probing, true) => self.try_launch(),
            (BondingState::Bonded(_), true) if !self.members.iter().any(|m| m == name) => {
                self.members.push(name.to_string());
                vec![BondingAction::AddPath(name.to_string())]
            }
            (BondingState::Bonded(_), false) => self.link_lost(name),
            _ => Vec::new(),
        }
    }

    fn link_lost(&mut self, name: &str) -> Vec<BondingAction> {
        if !matches!(self.state, BondingState::Bonded(_)) {
            return Vec::new();
        }
        let Some(idx) = self.members.iter().position(|m| m == name) else {
            return Vec::new();
        };

        self.members.remove(idx);
        if !self.members.is_empty() {
            self.last_failure = Some(LinkFailure::TransientLinkLoss {
                link: name.to_string(),
            });
            return vec![BondingAction::RemovePath(name.to_string())];
        }

        self.last_failure = Some(LinkFailure::TotalLinkLoss);
        self.backoff.reset();
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> Vec<BondingAction> {
        match self.backoff.next_delay() {
            Some(delay) => {
                let attempt = self.backoff.attempts();
                self.state = BondingState::Reconnecting { attempt };
                vec![BondingAction::ScheduleReconnect { delay, attempt }]
            }
            None => {
                self.state = BondingState::Closed(CloseReason::ReconnectExhausted);
                vec![BondingAction::Close(CloseReason::ReconnectExhausted)]
            }
        }
    }

    /// Reconnect timer fired
    pub fn on_reconnect_timer(&mut self) -> Vec<BondingAction> {
        if !matches!(self.state, BondingState::Reconnecting { .. }) {
            return Vec::new();
        }
        if self.usable_links().is_empty() {
            return self.schedule_reconnect();
        }
        self.try_launch()
    }

    /// The dedicated sender exited without being asked to
    ///
    /// Falls back to native multi-link for the rest of the run.
    pub fn on_sender_exit(&mut self) -> Vec<BondingAction> {
        if !matches!(
            self.state,
            BondingState::Bonded(BondingMode::ProtocolBonded { .. })
        ) {
            return Vec::new();
        }
        self.dedicated = None;
        if self.members.is_empty() {
            return self.schedule_reconnect();
        }
        self.state = BondingState::Bonded(BondingMode::NativeMultiLink);
        vec![BondingAction::Launch {
            mode: BondingMode::NativeMultiLink,
            links: self.members.clone(),
        }]
    }

    /// Close on request
    pub fn close(&mut self) -> Vec<BondingAction> {
        if matches!(self.state, BondingState::Closed(_)) {
            return Vec::new();
        }
        self.state = BondingState::Closed(CloseReason::Requested);
        self.members.clear();
        vec![BondingAction::Close(CloseReason::Requested)]
    }

    fn usable_links(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|l| l.state.is_usable())
            .map(|l| l.name.clone())
            .collect()
    }

    fn try_launch(&mut self) -> Vec<BondingAction> {
        let links = self.usable_links();
        if links.is_empty() {
            return Vec::new();
        }

        let mode = match &self.dedicated {
            Some(sender) => BondingMode::ProtocolBonded {
                sender: sender.clone(),
            },
            None => BondingMode::NativeMultiLink,
        };
        self.members = links.clone();
        self.backoff.reset();
        self.state = BondingState::Bonded(mode.clone());
        vec![BondingAction::Launch { mode, links }]
    }

    pub fn state(&self) -> &BondingState {
        &self.state
    }

    pub fn mode(&self) -> Option<&BondingMode> {
        match &self.state {
            BondingState::Bonded(mode) => Some(mode),
            _ => None,
        }
    }

    /// Current members in order
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn last_failure(&self) -> Option<&LinkFailure> {
        self.last_failure.as_ref()
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        match &self.state {
            BondingState::Idle | BondingState::Probing => SessionLifecycle::Starting,
            BondingState::Bonded(_) => {
                if self.links.iter().any(|l| !l.state.is_usable()) {
                    SessionLifecycle::Degraded
                } else {
                    SessionLifecycle::Active
                }
            }
            BondingState::Reconnecting { .. } => SessionLifecycle::Reconnecting,
            BondingState::Closed(_) => SessionLifecycle::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, BondingState::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::NetworkLink;

    fn link(id: u8, name: &str, state: LinkState) -> NetworkLink {
        let mut link = NetworkLink::discovered(id, name);
        link.state = state;
        link
    }

    fn up(id: u8, name: &str) -> LinkEvent {
        LinkEvent::Sample(link(id, name, LinkState::Up))
    }

    fn down(id: u8, name: &str) -> LinkEvent {
        LinkEvent::Down(link(id, name, LinkState::Down))
    }

    fn native_run() -> BondingStateMachine {
        let mut sm = BondingStateMachine::new(BondingPolicy::default());
        assert!(sm.start(None).is_empty());
        sm
    }

    #[test]
    fn test_probing_until_first_link() {
        let mut sm = native_run();
        assert_eq!(sm.lifecycle(), SessionLifecycle::Starting);

        assert!(sm
            .on_link_event(&LinkEvent::Discovered(NetworkLink::discovered(0, "eth0")))
            .is_empty());

        let actions = sm.on_link_event(&up(0, "eth0"));
        assert_eq!(
            actions,
            vec![BondingAction::Launch {
                mode: BondingMode::NativeMultiLink,
                links: vec!["eth0".to_string()],
            }]
        );
        assert_eq!(sm.lifecycle(), SessionLifecycle::Active);
    }

    #[test]
    fn test_dedicated_sender_selected_at_start() {
        let mut sm = BondingStateMachine::new(BondingPolicy::default());
        sm.start(Some(PathBuf::from("/usr/bin/srtla_send")));
        let actions = sm.on_link_event(&up(0, "wwan0"));

        assert!(matches!(
            &actions[0],
            BondingAction::Launch { mode: BondingMode::ProtocolBonded { .. }, .. }
        ));
    }

    #[test]
    fn test_membership_changes_keep_session() {
        let mut sm = native_run();
        sm.on_link_event(&up(0, "eth0"));
        assert_eq!(
            sm.on_link_event(&up(1, "wwan0")),
            vec![BondingAction::AddPath("wwan0".to_string())]
        );

        assert_eq!(
            sm.on_link_event(&down(0, "eth0")),
            vec![BondingAction::RemovePath("eth0".to_string())]
        );
        assert_eq!(sm.lifecycle(), SessionLifecycle::Degraded);
        assert_eq!(sm.members(), &["wwan0".to_string()]);
        assert!(matches!(
            sm.last_failure(),
            Some(LinkFailure::TransientLinkLoss { .. })
        ));

        assert_eq!(
            sm.on_link_event(&up(0, "eth0")),
            vec![BondingAction::AddPath("eth0".to_string())]
        );
        assert_eq!(sm.lifecycle(), SessionLifecycle::Active);
    }

    #[test]
    fn test_degraded_link_stays_member() {
        let mut sm = native_run();
        sm.on_link_event(&up(0, "eth0"));
        let actions = sm.on_link_event(&LinkEvent::Sample(link(0, "eth0", LinkState::Degraded)));
        assert!(actions.is_empty());
        assert_eq!(sm.members(), &["eth0".to_string()]);
    }

    #[test]
    fn test_total_loss_reconnects_then_relaunches() {
        let mut sm = native_run();
        sm.on_link_event(&up(0, "eth0"));

        let actions = sm.on_link_event(&down(0, "eth0"));
        assert_eq!(
            actions,
            vec![BondingAction::ScheduleReconnect {
                delay: Duration::from_secs(1),
                attempt: 1,
            }]
        );
        assert_eq!(sm.lifecycle(), SessionLifecycle::Reconnecting);
        assert_eq!(sm.last_failure(), Some(&LinkFailure::TotalLinkLoss));

        // Link back while waiting; restart happens on the timer
        assert!(sm.on_link_event(&up(0, "eth0")).is_empty());
        let actions = sm.on_reconnect_timer();
        assert!(matches!(&actions[0], BondingAction::Launch { links, .. } if links.len() == 1));
        assert_eq!(sm.lifecycle(), SessionLifecycle::Active);
    }

    #[test]
    fn test_reconnect_exhaustion_closes() {
        let policy = BondingPolicy {
            max_reconnect_attempts: 3,
            ..Default::default()
        };
        let mut sm = BondingStateMachine::new(policy);
        sm.start(None);
        sm.on_link_event(&up(0, "eth0"));
        sm.on_link_event(&down(0, "eth0"));

        let delays: Vec<_> = (0..2)
            .map(|_| match sm.on_reconnect_timer().as_slice() {
                [BondingAction::ScheduleReconnect { delay, .. }] => *delay,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(5)]);

        assert_eq!(
            sm.on_reconnect_timer(),
            vec![BondingAction::Close(CloseReason::ReconnectExhausted)]
        );
        assert!(sm.is_closed());
    }

    #[test]
    fn test_sender_exit_falls_back_for_rest_of_run() {
        let mut sm = BondingStateMachine::new(BondingPolicy::default());
        sm.start(Some(PathBuf::from("srtla_send")));
        sm.on_link_event(&up(0, "eth0"));

        let actions = sm.on_sender_exit();
        assert_eq!(
            actions,
            vec![BondingAction::Launch {
                mode: BondingMode::NativeMultiLink,
                links: vec!["eth0".to_string()],
            }]
        );

        // A later restart keeps the native mode
        sm.on_link_event(&down(0, "eth0"));
        sm.on_link_event(&up(0, "eth0"));
        let actions = sm.on_reconnect_timer();
        assert!(matches!(
            &actions[0],
            BondingAction::Launch { mode: BondingMode::NativeMultiLink, .. }
        ));

        // Native sender exits are not fallbacks
        assert!(sm.on_sender_exit().is_empty());
    }

    #[test]
    fn test_removed_interface() {
        let mut sm = native_run();
        sm.on_link_event(&up(0, "eth0"));
        sm.on_link_event(&up(1, "wlan0"));

        assert_eq!(
            sm.on_link_event(&LinkEvent::Removed("eth0".to_string())),
            vec![BondingAction::RemovePath("eth0".to_string())]
        );
        assert_eq!(sm.lifecycle(), SessionLifecycle::Active);
    }

    #[test]
    fn test_close_is_final() {
        let mut sm = native_run();
        sm.on_link_event(&up(0, "eth0"));
        assert_eq!(sm.close(), vec![BondingAction::Close(CloseReason::Requested)]);
        assert!(sm.close().is_empty());
        assert!(sm.on_link_event(&up(1, "wlan0")).is_empty());
    }
}
