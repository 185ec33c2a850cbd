//! The cell scheduler.
//!
//! At each tick, every open channel gets a byte budget derived from the
//! kernel's unacknowledged-byte count against the configured target depth,
//! and cells are drained in priority order: channel control cells
//! (DESTROYs) first, then circuit cells by lowest
//! exponentially-weighted moving average of recent emissions, then -- only
//! on an otherwise idle channel -- link padding. A newcomer circuit starts
//! at EWMA zero and is served immediately; every emission bumps its
//! average, so sustained traffic converges to an equal share per circuit.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use rand::Rng;
use tracing::trace;

use crate::cell::{Cell, CellBody};
use crate::channel::{ChannelHandle, ChannelRegistry};
use crate::circuit::{CircuitKey, CircuitStore};
use veil_common::cell::FIXED_CELL_LEN_V4;
use veil_common::CoreConfig;

/// Multiplier applied to a circuit's EWMA on each of its emissions.
const EWMA_DECAY: f64 = 0.9;

/// A cell the scheduler decided to put on the wire.
#[derive(Debug)]
pub struct ScheduledCell {
    pub chan: ChannelHandle,
    pub cell: Cell,
}

/// Chooses which circuit's cell goes out on which channel next.
pub struct Scheduler {
    /// Recent-emission average per circuit; lower wins.
    ewma: HashMap<CircuitKey, f64>,
    /// Channel-level cells that bypass circuit queues (DESTROY replies,
    /// handshake stragglers).
    control: HashMap<ChannelHandle, VecDeque<Cell>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            ewma: HashMap::new(),
            control: HashMap::new(),
        }
    }

    /// Queue a channel-level cell ahead of all circuit traffic.
    pub fn queue_control(&mut self, chan: ChannelHandle, cell: Cell) {
        self.control.entry(chan).or_default().push_back(cell);
    }

    /// Cancellation: a closed circuit's state is dropped entirely.
    pub fn forget_circuit(&mut self, key: CircuitKey) {
        self.ewma.remove(&key);
    }

    /// A torn-down channel takes its control queue with it.
    pub fn forget_channel(&mut self, chan: ChannelHandle) {
        self.control.remove(&chan);
    }

    /// True if any control cells are waiting on the channel.
    pub fn has_control_pending(&self, chan: ChannelHandle) -> bool {
        self.control.get(&chan).map_or(false, |q| !q.is_empty())
    }

    /// One scheduling pass. Emits as many cells as each channel's
    /// remaining kernel budget admits and updates per-channel accounting.
    pub fn tick<R: Rng>(
        &mut self,
        registry: &mut ChannelRegistry,
        store: &mut CircuitStore,
        config: &CoreConfig,
        now: Instant,
        rng: &mut R,
    ) -> Vec<ScheduledCell> {
        let mut out = Vec::new();
        for chan in registry.handles() {
            self.tick_channel(chan, registry, store, config, now, rng, &mut out);
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn tick_channel<R: Rng>(
        &mut self,
        chan: ChannelHandle,
        registry: &mut ChannelRegistry,
        store: &mut CircuitStore,
        config: &CoreConfig,
        now: Instant,
        rng: &mut R,
        out: &mut Vec<ScheduledCell>,
    ) {
        let (mut budget, open) = match registry.get(chan) {
            Some(channel) => {
                let capacity = config
                    .kist_target_kernel_queue_bytes
                    .saturating_sub(channel.unacked_bytes);
                (capacity / FIXED_CELL_LEN_V4, channel.is_open())
            }
            None => return,
        };
        if !open {
            return;
        }

        // Circuits with a queue draining onto this channel.
        let mut candidates: Vec<CircuitKey> = store
            .handles()
            .into_iter()
            .filter(|key| {
                store
                    .get_mut(*key)
                    .and_then(|c| c.queue_for(chan).map(|q| !q.is_empty()))
                    .unwrap_or(false)
            })
            .collect();

        let mut sent_real = false;
        while budget > 0 {
            // Control cells preempt everything.
            if let Some(cell) = self.control.get_mut(&chan).and_then(|q| q.pop_front()) {
                out.push(ScheduledCell { chan, cell });
                budget -= 1;
                sent_real = true;
                continue;
            }

            // Lowest-EWMA circuit with pending cells wins this slot.
            let pick = candidates
                .iter()
                .copied()
                .min_by(|a, b| {
                    let ea = self.ewma.get(a).copied().unwrap_or(0.0);
                    let eb = self.ewma.get(b).copied().unwrap_or(0.0);
                    ea.partial_cmp(&eb).unwrap_or(std::cmp::Ordering::Equal)
                });
            let Some(key) = pick else { break };

            let cell = store
                .get_mut(key)
                .and_then(|c| c.queue_for(chan))
                .and_then(|q| q.pop_front());
            match cell {
                Some(queued) => {
                    out.push(ScheduledCell {
                        chan,
                        cell: queued.cell,
                    });
                    budget -= 1;
                    sent_real = true;
                    let ewma = self.ewma.entry(key).or_insert(0.0);
                    *ewma = *ewma * EWMA_DECAY + 1.0;
                    trace!(?key, ewma = *ewma, "scheduled circuit cell");
                    // Drop drained circuits from this pass.
                    let empty = store
                        .get_mut(key)
                        .and_then(|c| c.queue_for(chan).map(|q| q.is_empty()))
                        .unwrap_or(true);
                    if empty {
                        candidates.retain(|k| *k != key);
                    }
                }
                None => {
                    candidates.retain(|k| *k != key);
                }
            }
        }

        // Padding runs strictly below real traffic: only on a channel that
        // sent nothing and has budget to spare.
        if !sent_real && budget > 0 {
            if let Some(channel) = registry.get_mut(chan) {
                if channel.padding_timer.padding_due(now, rng) {
                    out.push(ScheduledCell {
                        chan,
                        cell: Cell::control(CellBody::Padding),
                    });
                }
            }
        }

        // Account what we handed to the kernel this pass.
        let sent_here = out.iter().filter(|s| s.chan == chan).count();
        if sent_here > 0 {
            if let Some(channel) = registry.get_mut(chan) {
                channel.unacked_bytes += sent_here * FIXED_CELL_LEN_V4;
                for s in out.iter().filter(|s| s.chan == chan) {
                    let padding = matches!(s.cell.body, CellBody::Padding | CellBody::Vpadding(_));
                    channel.note_cell_out(padding, now);
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CircId, DestroyReason};
    use crate::channel::{Channel, ChannelDirection, LinkInfo, PaddingTimer};
    use crate::circuit::{ChannelSide, CircuitPurpose, GlobalCircId, OriginCircuit};

    fn setup() -> (ChannelRegistry, CircuitStore, ChannelHandle) {
        let mut registry = ChannelRegistry::new();
        let now = Instant::now();
        let chan = registry.add(Channel::new(
            &LinkInfo {
                link_version: 4,
                peer_identity: Some([1; 32]),
                clock_skew_secs: 0,
            },
            "192.0.2.1:9001".parse().unwrap(),
            ChannelDirection::Outbound,
            now,
            PaddingTimer::disabled(now),
        ));
        (registry, CircuitStore::new(), chan)
    }

    fn add_circuit(
        store: &mut CircuitStore,
        registry: &mut ChannelRegistry,
        chan: ChannelHandle,
        circ_id: u32,
        global: u64,
    ) -> CircuitKey {
        store.insert(
            registry,
            crate::circuit::Circuit::Origin(OriginCircuit::new(
                GlobalCircId(global),
                ChannelSide {
                    chan,
                    circ_id: CircId(circ_id),
                },
                CircuitPurpose::General,
                Vec::new(),
                8,
                Instant::now(),
            )),
        )
    }

    fn fill_queue(store: &mut CircuitStore, key: CircuitKey, chan: ChannelHandle, n: usize) {
        let now = Instant::now();
        let circuit = store.get_mut(key).unwrap();
        let circ_id = circuit.sides()[0].circ_id;
        for _ in 0..n {
            circuit.enqueue(
                chan,
                Cell::new(circ_id, CellBody::Destroy(DestroyReason::None)),
                now,
            );
        }
    }

    /// One cell of budget per tick: two busy circuits end up served within
    /// a few cells of each other.
    #[test]
    fn test_fairness_two_circuits() {
        let (mut registry, mut store, chan) = setup();
        let a = add_circuit(&mut store, &mut registry, chan, 0x8000_0001, 1);
        let b = add_circuit(&mut store, &mut registry, chan, 0x8000_0002, 2);
        fill_queue(&mut store, a, chan, 1200);
        fill_queue(&mut store, b, chan, 1200);

        let mut config = CoreConfig::default();
        config.kist_target_kernel_queue_bytes = FIXED_CELL_LEN_V4;

        let mut scheduler = Scheduler::new();
        let mut rng = rand::thread_rng();
        let mut sent = HashMap::new();
        let now = Instant::now();
        for _ in 0..1000 {
            // Kernel drained everything between ticks
            registry.get_mut(chan).unwrap().unacked_bytes = 0;
            for s in scheduler.tick(&mut registry, &mut store, &config, now, &mut rng) {
                let circ_id = s.cell.circ_id;
                *sent.entry(circ_id).or_insert(0u32) += 1;
            }
        }

        let a_count = sent.get(&CircId(0x8000_0001)).copied().unwrap_or(0);
        let b_count = sent.get(&CircId(0x8000_0002)).copied().unwrap_or(0);
        assert_eq!(a_count + b_count, 1000);
        assert!(
            a_count.abs_diff(b_count) <= 5,
            "unfair split: {} vs {}",
            a_count,
            b_count
        );
    }

    /// A newcomer gets served immediately but cannot starve the incumbent.
    #[test]
    fn test_newcomer_served_immediately() {
        let (mut registry, mut store, chan) = setup();
        let incumbent = add_circuit(&mut store, &mut registry, chan, 0x8000_0001, 1);
        fill_queue(&mut store, incumbent, chan, 200);

        let mut config = CoreConfig::default();
        config.kist_target_kernel_queue_bytes = FIXED_CELL_LEN_V4;
        let mut scheduler = Scheduler::new();
        let mut rng = rand::thread_rng();
        let now = Instant::now();

        // Let the incumbent build up EWMA
        for _ in 0..50 {
            registry.get_mut(chan).unwrap().unacked_bytes = 0;
            scheduler.tick(&mut registry, &mut store, &config, now, &mut rng);
        }

        let newcomer = add_circuit(&mut store, &mut registry, chan, 0x8000_0002, 2);
        fill_queue(&mut store, newcomer, chan, 200);
        registry.get_mut(chan).unwrap().unacked_bytes = 0;
        let cells = scheduler.tick(&mut registry, &mut store, &config, now, &mut rng);
        assert_eq!(cells[0].cell.circ_id, CircId(0x8000_0002));

        // And the incumbent is back in the rotation within a few ticks
        let mut incumbent_served = false;
        for _ in 0..5 {
            registry.get_mut(chan).unwrap().unacked_bytes = 0;
            for s in scheduler.tick(&mut registry, &mut store, &config, now, &mut rng) {
                if s.cell.circ_id == CircId(0x8000_0001) {
                    incumbent_served = true;
                }
            }
        }
        assert!(incumbent_served);
    }

    /// No budget, no emission: KIST pressure stops the channel.
    #[test]
    fn test_kernel_pressure_blocks_channel() {
        let (mut registry, mut store, chan) = setup();
        let key = add_circuit(&mut store, &mut registry, chan, 0x8000_0001, 1);
        fill_queue(&mut store, key, chan, 10);

        let config = CoreConfig::default();
        registry.get_mut(chan).unwrap().unacked_bytes = config.kist_target_kernel_queue_bytes;

        let mut scheduler = Scheduler::new();
        let mut rng = rand::thread_rng();
        let cells = scheduler.tick(&mut registry, &mut store, &config, Instant::now(), &mut rng);
        assert!(cells.is_empty());
    }

    /// Control cells go out ahead of circuit cells.
    #[test]
    fn test_control_preempts_circuits() {
        let (mut registry, mut store, chan) = setup();
        let key = add_circuit(&mut store, &mut registry, chan, 0x8000_0001, 1);
        fill_queue(&mut store, key, chan, 5);

        let mut scheduler = Scheduler::new();
        scheduler.queue_control(
            chan,
            Cell::new(CircId(0x7000_0001), CellBody::Destroy(DestroyReason::Protocol)),
        );

        let mut config = CoreConfig::default();
        config.kist_target_kernel_queue_bytes = FIXED_CELL_LEN_V4 * 2;
        let mut rng = rand::thread_rng();
        let cells = scheduler.tick(&mut registry, &mut store, &config, Instant::now(), &mut rng);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].cell.circ_id, CircId(0x7000_0001));
        assert_eq!(cells[1].cell.circ_id, CircId(0x8000_0001));
    }

    /// Padding only fires on an otherwise idle channel.
    #[test]
    fn test_padding_lowest_priority() {
        let (mut registry, mut store, chan) = setup();
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        // Arm an always-due padding timer
        registry.get_mut(chan).unwrap().padding_timer = PaddingTimer::new(
            now.checked_sub(std::time::Duration::from_secs(60)).unwrap_or(now),
            &mut rng,
        );

        let key = add_circuit(&mut store, &mut registry, chan, 0x8000_0001, 1);
        fill_queue(&mut store, key, chan, 1);

        let config = CoreConfig::default();
        let mut scheduler = Scheduler::new();
        let cells = scheduler.tick(&mut registry, &mut store, &config, now, &mut rng);
        // The real cell went out; no padding alongside it
        assert!(cells
            .iter()
            .all(|s| !matches!(s.cell.body, CellBody::Padding)));

        // Next tick the channel is idle: padding may flow
        registry.get_mut(chan).unwrap().unacked_bytes = 0;
        let cells = scheduler.tick(&mut registry, &mut store, &config, now, &mut rng);
        assert!(cells
            .iter()
            .all(|s| matches!(s.cell.body, CellBody::Padding)));
    }

    /// Closed circuits vanish from the rotation.
    #[test]
    fn test_forget_circuit_cancels_cells() {
        let (mut registry, mut store, chan) = setup();
        let key = add_circuit(&mut store, &mut registry, chan, 0x8000_0001, 1);
        fill_queue(&mut store, key, chan, 5);

        store
            .close(&mut registry, key, DestroyReason::Requested, None)
            .unwrap();
        let mut scheduler = Scheduler::new();
        scheduler.forget_circuit(key);

        let config = CoreConfig::default();
        let mut rng = rand::thread_rng();
        let cells = scheduler.tick(&mut registry, &mut store, &config, Instant::now(), &mut rng);
        // Only the DESTROY the caller queues would remain; none was queued
        assert!(cells.is_empty());
    }
}
