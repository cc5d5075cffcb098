//! Property tests for bonded session membership
//!
//! The bonding state machine is driven with random link event sequences and
//! compared against a plain model of which links are usable.

use proptest::prelude::*;
use rato_bonding::{
    BondingAction, BondingMode, BondingPolicy, BondingStateMachine, CloseReason, LinkEvent,
    NetworkLink, SessionLifecycle,
};
use rato_protocol::LinkState;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const LINKS: [&str; 4] = ["wwan0", "wwan1", "wlan0", "eth0"];

#[derive(Debug, Clone, Copy)]
enum Step {
    Up(usize),
    Degraded(usize),
    Down(usize),
    Removed(usize),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0..LINKS.len()).prop_map(Step::Up),
        1 => (0..LINKS.len()).prop_map(Step::Degraded),
        2 => (0..LINKS.len()).prop_map(Step::Down),
        1 => (0..LINKS.len()).prop_map(Step::Removed),
    ]
}

fn link(index: usize, state: LinkState) -> NetworkLink {
    let mut link = NetworkLink::discovered(index as u8, LINKS[index]);
    link.state = state;
    link
}

fn event(step: Step) -> LinkEvent {
    match step {
        Step::Up(i) => LinkEvent::Sample(link(i, LinkState::Up)),
        Step::Degraded(i) => LinkEvent::Sample(link(i, LinkState::Degraded)),
        Step::Down(i) => LinkEvent::Down(link(i, LinkState::Down)),
        Step::Removed(i) => LinkEvent::Removed(LINKS[i].to_string()),
    }
}

/// Which links the monitor last reported as usable
#[derive(Default)]
struct Model {
    links: BTreeMap<usize, bool>,
}

impl Model {
    fn apply(&mut self, step: Step) {
        match step {
            Step::Up(i) | Step::Degraded(i) => {
                self.links.insert(i, true);
            }
            Step::Down(i) => {
                self.links.insert(i, false);
            }
            Step::Removed(i) => {
                self.links.remove(&i);
            }
        }
    }

    fn usable(&self) -> BTreeSet<String> {
        self.links
            .iter()
            .filter(|(_, usable)| **usable)
            .map(|(i, _)| LINKS[*i].to_string())
            .collect()
    }
}

fn policy(max_attempts: u32) -> BondingPolicy {
    BondingPolicy {
        reconnect_steps: vec![Duration::from_secs(1), Duration::from_secs(2)],
        max_reconnect_attempts: max_attempts,
    }
}

fn native_machine(max_attempts: u32) -> BondingStateMachine {
    let mut sm = BondingStateMachine::new(policy(max_attempts));
    assert!(sm.start(None).is_empty());
    sm
}

fn is_loss_action(action: &BondingAction) -> bool {
    matches!(
        action,
        BondingAction::ScheduleReconnect { .. } | BondingAction::Close(_)
    )
}

proptest! {
    /// While one link stays usable the session never reconnects or closes,
    /// and its members are exactly the usable links.
    #[test]
    fn prop_members_track_usable_links(steps in prop::collection::vec(step_strategy(), 1..80)) {
        let mut sm = native_machine(3);
        let mut model = Model::default();
        let mut bonded = false;

        for step in steps {
            let mut next = Model { links: model.links.clone() };
            next.apply(step);
            if bonded && next.usable().is_empty() {
                // Leave total loss to the other property
                continue;
            }
            model = next;

            let actions = sm.on_link_event(&event(step));
            prop_assert!(!actions.iter().any(is_loss_action), "unexpected {:?}", actions);

            if !model.usable().is_empty() {
                bonded = true;
            }
            if bonded {
                prop_assert_eq!(sm.mode(), Some(&BondingMode::NativeMultiLink));
                let members: BTreeSet<String> = sm.members().iter().cloned().collect();
                prop_assert_eq!(members, model.usable());
                prop_assert_ne!(sm.lifecycle(), SessionLifecycle::Reconnecting);
            }
            prop_assert!(!sm.is_closed());
        }
    }

    /// Losing every link reconnects first, and closes only after exhausting
    /// exactly the configured number of attempts.
    #[test]
    fn prop_total_loss_exhausts_attempts(
        link_count in 1..=LINKS.len(),
        order in Just((0..LINKS.len()).collect::<Vec<_>>()).prop_shuffle(),
        max_attempts in 1u32..8,
    ) {
        let mut sm = native_machine(max_attempts);
        for i in 0..link_count {
            sm.on_link_event(&event(Step::Up(i)));
        }
        prop_assert_eq!(sm.members().len(), link_count);

        let mut scheduled = 0;
        for i in order.into_iter().filter(|i| *i < link_count) {
            for action in sm.on_link_event(&event(Step::Down(i))) {
                match action {
                    BondingAction::ScheduleReconnect { attempt, .. } => {
                        scheduled += 1;
                        prop_assert_eq!(attempt, 1);
                    }
                    BondingAction::Close(_) => prop_assert!(false, "closed on first loss"),
                    _ => {}
                }
            }
        }
        prop_assert_eq!(scheduled, 1);
        prop_assert_eq!(sm.lifecycle(), SessionLifecycle::Reconnecting);
        prop_assert!(sm.members().is_empty());

        for expected in 2..=max_attempts {
            prop_assert!(!sm.is_closed());
            let actions = sm.on_reconnect_timer();
            prop_assert_eq!(actions.len(), 1);
            prop_assert!(
                matches!(actions[0], BondingAction::ScheduleReconnect { attempt, .. } if attempt == expected),
                "unexpected {:?}",
                actions
            );
        }

        prop_assert!(!sm.is_closed());
        let actions = sm.on_reconnect_timer();
        prop_assert_eq!(actions, vec![BondingAction::Close(CloseReason::ReconnectExhausted)]);
        prop_assert!(sm.is_closed());
        prop_assert_eq!(sm.lifecycle(), SessionLifecycle::Closed);
    }
}

#[test]
fn test_link_back_during_reconnect_relaunches() {
    let mut sm = native_machine(5);
    sm.on_link_event(&event(Step::Up(0)));
    sm.on_link_event(&event(Step::Up(1)));
    sm.on_link_event(&event(Step::Down(0)));
    let actions = sm.on_link_event(&event(Step::Down(1)));
    assert!(matches!(
        actions.as_slice(),
        [BondingAction::ScheduleReconnect { attempt: 1, .. }]
    ));

    // The relaunch waits for the timer even when a link returns early
    assert!(sm.on_link_event(&event(Step::Up(1))).is_empty());
    assert_eq!(sm.lifecycle(), SessionLifecycle::Reconnecting);

    let actions = sm.on_reconnect_timer();
    assert_eq!(
        actions,
        vec![BondingAction::Launch {
            mode: BondingMode::NativeMultiLink,
            links: vec!["wwan1".to_string()],
        }]
    );
    assert_eq!(sm.members(), ["wwan1".to_string()]);
    assert_eq!(sm.lifecycle(), SessionLifecycle::Degraded);
}

#[test]
fn test_dedicated_sender_exit_falls_back_to_native() {
    let mut sm = BondingStateMachine::new(policy(3));
    sm.start(Some("/usr/bin/srtla_send".into()));
    let actions = sm.on_link_event(&event(Step::Up(0)));
    assert!(matches!(
        actions.as_slice(),
        [BondingAction::Launch { mode: BondingMode::ProtocolBonded { .. }, .. }]
    ));

    let actions = sm.on_sender_exit();
    assert_eq!(
        actions,
        vec![BondingAction::Launch {
            mode: BondingMode::NativeMultiLink,
            links: vec!["wwan0".to_string()],
        }]
    );

    // A second exit is not a protocol-bonded exit any more
    assert!(sm.on_sender_exit().is_empty());
}
