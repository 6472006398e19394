//! Epoch fencing for "the currently selected session".
//!
//! A switch bumps the epoch and moves the pointer before any dependent request
//! goes out, so a late payload for the previous session can be dropped on
//! arrival no matter how the transport orders responses. The context only
//! changes how results are interpreted; it never cancels in-flight work.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
	/// Payload has no session id but a session is already selected.
	Unscoped,
	/// Payload belongs to a session other than the selected one.
	OtherSession,
	/// Payload carries an epoch older than the latest switch.
	StaleEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
	Accept,
	/// First scoped payload while nothing was selected; it is now the selection.
	Adopted,
	Reject(Rejection),
}

impl Verdict {
	pub fn is_accepted(self) -> bool {
		!matches!(self, Verdict::Reject(_))
	}
}

/// One side's view of the selection. Client and server each hold their own.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
	current: Option<String>,
	epoch: u64,
	/// tmux session that untargeted input goes to.
	target: Option<String>,
}

impl SessionContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current(&self) -> Option<&str> {
		self.current.as_deref()
	}

	pub fn epoch(&self) -> u64 {
		self.epoch
	}

	pub fn target(&self) -> Option<&str> {
		self.target.as_deref()
	}

	pub fn set_target(&mut self, target: Option<String>) {
		self.target = target;
	}

	/// Local switch: bump the epoch and move the pointer. Returns the epoch the
	/// caller must attach to requests issued for the new session.
	pub fn begin_switch(&mut self, session_id: impl Into<String>) -> u64 {
		self.epoch += 1;
		self.current = Some(session_id.into());
		self.epoch
	}

	/// Switch requested by a peer that tracks its own epoch. Moving to another
	/// session needs an epoch above the current one; repeating the switch
	/// already applied is a no-op.
	pub fn apply_switch(
		&mut self,
		session_id: impl Into<String>,
		epoch: Option<u64>,
	) -> Result<u64, Rejection> {
		let session_id = session_id.into();
		match epoch {
			Some(e) if e == self.epoch && self.current.as_deref() == Some(session_id.as_str()) => {
				Ok(self.epoch)
			}
			Some(e) if e <= self.epoch => Err(Rejection::StaleEpoch),
			Some(e) => {
				self.epoch = e;
				self.current = Some(session_id);
				Ok(self.epoch)
			}
			None => Ok(self.begin_switch(session_id)),
		}
	}

	/// Decides whether a session-scoped payload may be applied. With nothing
	/// selected yet, the payload's session becomes the selection.
	pub fn validate(&mut self, session_id: Option<&str>, epoch: Option<u64>) -> Verdict {
		if self.current.is_none() {
			if let Some(id) = session_id {
				self.current = Some(id.to_string());
				return Verdict::Adopted;
			}
		}
		self.check(session_id, epoch)
	}

	/// Same decision as [`validate`](Self::validate) without ever moving the
	/// selection. Used for pushes the client did not ask for.
	pub fn check(&self, session_id: Option<&str>, epoch: Option<u64>) -> Verdict {
		let Some(current) = self.current.as_deref() else {
			return Verdict::Accept;
		};

		let Some(id) = session_id else {
			return Verdict::Reject(Rejection::Unscoped);
		};
		if id != current {
			return Verdict::Reject(Rejection::OtherSession);
		}
		if matches!(epoch, Some(e) if e < self.epoch) {
			return Verdict::Reject(Rejection::StaleEpoch);
		}
		Verdict::Accept
	}
}
