use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::proxy::OutboundProxy;

/// The recovered contents of the COLLECTION onion layer: where to make
/// initial contact, how long to wait before the second hop, and where
/// the final redirect should land. Field names follow the NET JSON
/// schema in spec.md §6.
///
/// Every field but `passphrase` is optional: a NET missing a field
/// parses successfully, and the gap is only discovered (and reported,
/// by name) when the stage that needs it runs, matching `acs_net_string`
/// / `acs_net_number`'s deferred per-field validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Net {
	pub window: Option<u64>,
	pub wait: Option<u64>,
	pub redirect: Option<String>,
	pub initial: Option<String>,
	#[serde(default)]
	pub passphrase: String,
}

/// One of the three statuses a dance stage can publish, serialized as
/// the lowercase strings the original's `l_statusnames` table used.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcsStatus {
	Err,
	Ok,
	Done,
}

/// `(status, message)` pair published to `progress` long-pollers,
/// matching `acs_result`'s JSON shape exactly — no extra fields.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
	pub status: AcsStatus,
	pub message: String,
}

impl StatusEvent {
	fn new(status: AcsStatus, message: impl Into<String>) -> Self {
		StatusEvent {
			status,
			message: message.into(),
		}
	}
}

const DONE_MESSAGE: &str = "ACS completed succesfully, you can start Tor over StegoTorus over DGW";

/// Current snapshot plus a bounded FIFO of events not yet drained by a
/// `progress` poll. `current` is updated on every publish and never
/// popped; `queue` is drained by `progress` in order.
struct Status {
	current: StatusEvent,
	queue: VecDeque<StatusEvent>,
	dropped: u64,
	cap: usize,
}

impl Status {
	fn publish(&mut self, event: StatusEvent) {
		self.current = event.clone();
		if self.queue.len() >= self.cap {
			self.queue.pop_front();
			self.dropped += 1;
		}
		self.queue.push_back(event);
	}
}

/// Drives the three-stage ACS dance (initial contact, jittered wait,
/// redirect) against the endpoints named in a recovered [`Net`] record,
/// and exposes its progress to long-polling clients via [`Dancer::progress`].
///
/// Lock order is always `dancing` before `status` (never the reverse),
/// and `status` is never released and reacquired mid-operation inside a
/// single call — this was an Open Question in the original design
/// (a transient status-lock release inside `acs_progress`) that is
/// deliberately not replicated here: `progress` spawns the whole dance
/// as a background task instead of calling the first stage inline.
pub struct Dancer {
	dancing: AtomicBool,
	net: Mutex<Option<Net>>,
	status: Mutex<Status>,
	notify: Notify,
	proxy: Arc<dyn OutboundProxy>,
	progress_timeout: Duration,
}

impl Dancer {
	pub fn new(proxy: Arc<dyn OutboundProxy>, history_cap: usize, progress_timeout: Duration) -> Arc<Self> {
		Arc::new(Dancer {
			dancing: AtomicBool::new(false),
			net: Mutex::new(None),
			status: Mutex::new(Status {
				current: StatusEvent::new(AcsStatus::Ok, "ACS Dancer Initialzed"),
				queue: VecDeque::with_capacity(history_cap.min(64)),
				dropped: 0,
				cap: history_cap,
			}),
			notify: Notify::new(),
			proxy,
			progress_timeout,
		})
	}

	/// Records a recovered NET record (or clears it, for `net = None`)
	/// and publishes "Ready to Dance"/"Please provide a NET". Refuses
	/// (returns `false`) if a dance is already in flight; unlike the
	/// original's `acs_set_net` — whose `XXX` comment notes the BASE
	/// peel path ignores this refusal — the refusal is always surfaced
	/// as an `Err` status event here (spec.md Design Notes).
	pub async fn set_net(&self, net: Option<Net>) -> bool {
		if self.dancing.load(Ordering::Acquire) {
			self.emit_err("a NET was provided while already dancing").await;
			return false;
		}

		*self.net.lock().await = net.clone();
		match net {
			Some(_) => self.emit_ok("Ready to Dance").await,
			None => self.emit_ok("Please provide a NET").await,
		}
		true
	}

	/// `POST /acs/setup/`: accepts a whole NET body. Returns `true` on
	/// success, `false` if a dance is already in progress.
	pub async fn setup(&self, net: Net) -> bool {
		self.set_net(Some(net)).await
	}

	async fn emit_ok(&self, message: impl Into<String>) {
		self.publish(StatusEvent::new(AcsStatus::Ok, message)).await;
	}

	async fn emit_err(&self, message: impl Into<String>) {
		self.publish(StatusEvent::new(AcsStatus::Err, message)).await;
	}

	async fn publish(&self, event: StatusEvent) {
		let mut status = self.status.lock().await;
		status.publish(event);
		drop(status);
		self.notify.notify_waiters();
	}

	/// Returns the oldest undrained event, kicking the dance off first
	/// if it is idle and the last published status was OK — mirrors
	/// `acs_progress`'s lock-dancing-then-status, start-on-idle-OK
	/// sequence. If nothing is queued, waits up to `progress_timeout`
	/// for a publish; on timeout, replies with the current snapshot
	/// rather than blocking forever (matches the original's 5s
	/// `cond_wait`).
	pub async fn progress(self: &Arc<Self>) -> StatusEvent {
		if !self.dancing.load(Ordering::Acquire) {
			let should_start = self.status.lock().await.current.status == AcsStatus::Ok;
			if should_start {
				self.dancing.store(true, Ordering::Release);
				let net = self.net.lock().await.clone();
				let this = self.clone();
				tokio::spawn(async move {
					this.run_dance(net).await;
				});
			}
		}

		if let Some(event) = self.pop_queued().await {
			return event;
		}

		let _ = tokio::time::timeout(self.progress_timeout, self.notify.notified()).await;

		if let Some(event) = self.pop_queued().await {
			return event;
		}
		self.status.lock().await.current.clone()
	}

	async fn pop_queued(&self) -> Option<StatusEvent> {
		self.status.lock().await.queue.pop_front()
	}

	/// Number of events dropped from the history because it exceeded
	/// its capacity, for diagnostics.
	pub async fn dropped_count(&self) -> u64 {
		self.status.lock().await.dropped
	}

	/// Runs the whole INITIAL -> WAIT -> REDIRECT -> DONE sequence for
	/// `net`, publishing a status event per stage transition, then
	/// clears `dancing`. Any missing-field or non-200 outcome ends the
	/// dance early with an `Err` event.
	async fn run_dance(self: Arc<Self>, net: Option<Net>) {
		let net = match net {
			Some(net) => net,
			None => {
				self.emit_err("No NET in ACS").await;
				self.dancing.store(false, Ordering::Release);
				return;
			}
		};

		if !self.stage_initial(&net).await {
			self.dancing.store(false, Ordering::Release);
			return;
		}

		if !self.stage_wait(&net).await {
			self.dancing.store(false, Ordering::Release);
			return;
		}

		if !self.stage_redirect(&net).await {
			self.dancing.store(false, Ordering::Release);
			return;
		}

		self.emit(StatusEvent::new(AcsStatus::Done, DONE_MESSAGE)).await;
		self.dancing.store(false, Ordering::Release);
	}

	async fn emit(&self, event: StatusEvent) {
		self.publish(event).await;
	}

	/// `true` on a 200 response, after publishing the success/failure
	/// event; `false` otherwise (caller must stop the dance). The
	/// "ACS Initial Gateway" wording (rather than the generic "No X in
	/// NET" every other field uses) matches `acs_initial`'s own
	/// hand-written check.
	async fn stage_initial(&self, net: &Net) -> bool {
		let initial = match &net.initial {
			Some(initial) => initial,
			None => {
				self.emit_err("No ACS Initial Gateway in NET").await;
				return false;
			}
		};
		self.emit_ok("Dancing: Initial Request sent").await;
		self.hop(initial, "ACS Initial").await
	}

	async fn stage_redirect(&self, net: &Net) -> bool {
		let redirect = match &net.redirect {
			Some(redirect) => redirect,
			None => {
				self.emit_err("No Redirect Gateway in NET").await;
				return false;
			}
		};
		self.emit_ok("Dancing: Redirect Request sent").await;
		self.hop(redirect, "ACS Redirect").await
	}

	async fn hop(&self, host: &str, label: &str) -> bool {
		match self.proxy.get(host).await {
			Ok(status) if status == 200 => {
				self.emit_ok(format!("{label} success: {status}")).await;
				true
			}
			Ok(status) => {
				self.emit_err(format!("{label} failed: {status}")).await;
				false
			}
			Err(e) => {
				self.emit_err(format!("{label} failed: {e}")).await;
				false
			}
		}
	}

	/// Returns `false` (and ends the dance) if `window` or `wait` is
	/// missing from the NET, each reported by its own message.
	async fn stage_wait(&self, net: &Net) -> bool {
		let wait = match net.wait {
			Some(wait) => wait,
			None => {
				self.emit_err("No Delay wait in NET").await;
				return false;
			}
		};
		let window = match net.window {
			Some(window) => window,
			None => {
				self.emit_err("No Delay window in NET").await;
				return false;
			}
		};

		let delay = if window > 0 { wait + (rand::thread_rng().gen::<u64>() % window) } else { wait };
		self.emit_ok(format!("Moonwalking for {delay} seconds...")).await;
		tokio::time::sleep(Duration::from_secs(delay)).await;
		self.emit_ok("Moonwalk done").await;
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proxy::mock::MockProxy;

	fn sample_net() -> Net {
		Net {
			window: Some(1),
			wait: Some(0),
			redirect: Some("redirect.example".to_string()),
			initial: Some("initial.example".to_string()),
			passphrase: "8b42c8971567e309c5fe7865".to_string(),
		}
	}

	#[tokio::test]
	async fn dance_runs_through_all_stages_to_done() {
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy.clone(), 1024, Duration::from_secs(5));

		assert!(dancer.set_net(Some(sample_net())).await);

		let mut saw_done = false;
		for _ in 0..50 {
			let event = dancer.progress().await;
			if event.status == AcsStatus::Done {
				saw_done = true;
				break;
			}
		}
		assert!(saw_done, "dance did not reach Done in time");
		assert_eq!(proxy.calls.lock().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn set_net_while_dancing_is_refused_with_err_status() {
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy, 1024, Duration::from_secs(5));

		let mut slow_net = sample_net();
		slow_net.wait = Some(2);
		slow_net.window = Some(1);
		assert!(dancer.set_net(Some(slow_net)).await);

		// kick the dance off so `dancing` flips true
		let kicked = dancer.progress().await;
		assert_eq!(kicked.status, AcsStatus::Ok);

		let refused = dancer.set_net(Some(sample_net())).await;
		assert!(!refused);

		let event = dancer.progress().await;
		assert_eq!(event.status, AcsStatus::Err);
	}

	#[tokio::test]
	async fn dance_reports_missing_redirect_by_name_and_stops() {
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy.clone(), 1024, Duration::from_secs(5));

		let mut net = sample_net();
		net.redirect = None;
		assert!(dancer.set_net(Some(net)).await);

		let mut last = dancer.progress().await;
		for _ in 0..50 {
			if last.status == AcsStatus::Err {
				break;
			}
			last = dancer.progress().await;
		}
		assert_eq!(last.status, AcsStatus::Err);
		assert_eq!(last.message, "No Redirect Gateway in NET");
		// only the initial hop happened; redirect was never reached
		assert_eq!(proxy.calls.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn history_drops_oldest_past_capacity() {
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy, 2, Duration::from_secs(5));
		dancer.emit_ok("one").await;
		dancer.emit_ok("two").await;
		dancer.emit_ok("three").await;
		assert_eq!(dancer.dropped_count().await, 1);
	}

	#[tokio::test]
	async fn progress_pops_queue_in_fifo_order_before_falling_back_to_current() {
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy, 1024, Duration::from_millis(20));
		dancer.emit_ok("first").await;
		dancer.emit_ok("second").await;

		assert_eq!(dancer.progress().await.message, "first");
		assert_eq!(dancer.progress().await.message, "second");
		// queue now empty; falls back to the current snapshot after timing out
		assert_eq!(dancer.progress().await.message, "second");
	}
}
