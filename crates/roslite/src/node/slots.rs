// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry slot types and user callback signatures.
//!
//! Slots follow the lifecycle: created on registration, master registration
//! pending, registered, running, unregistration pending, freed. Every slot
//! is either free or owns exactly one master registry entry; the
//! `registered` flag tracks which.

use std::sync::Arc;

use crate::arena::SlotRef;
use crate::clock::PeriodicSchedule;
use crate::error::ErrorPack;
use crate::msg::{Message, MessageSchema};

/// Delivery callback for a subscriber slot.
pub type SubscriberCallback = Box<dyn FnMut(&Message)>;

/// Publish-time fill callback for a periodic publisher.
pub type PublishFillCallback = Box<dyn FnMut(&mut Message)>;

/// Service handler: fill the response from the request, return the ok flag.
pub type ServiceHandler = Box<dyn FnMut(&Message, &mut Message) -> bool>;

/// Events delivered to a service caller's dual-mode callback.
pub enum CallerEvent<'a> {
    /// A periodic call is due: fill the request in place.
    FillRequest(&'a mut Message),
    /// The provider answered.
    Response(&'a Message),
    /// The call failed (provider error, transport, timeout).
    Failed(ErrorPack),
}

/// Service caller callback.
pub type CallerCallback = Box<dyn FnMut(CallerEvent<'_>)>;

// ============================================================================
// Slots
// ============================================================================

/// One advertised topic.
pub struct PublisherSlot {
    pub topic: String,
    pub type_name: String,
    pub md5: String,
    pub schema: Arc<MessageSchema>,
    pub latching: bool,
    /// Per-subscriber frame queue bound (drop-oldest beyond this).
    pub queue_size: usize,
    /// Fill callback invoked on each periodic tick.
    pub fill: Option<PublishFillCallback>,
    pub schedule: PeriodicSchedule,
    /// Confirmed present in the master registry.
    pub registered: bool,
    /// Unregister enqueued; the slot is freed when it completes.
    pub unregister_pending: bool,
    /// Connected subscriber channels (peer arena references).
    pub peers: Vec<SlotRef>,
    /// Last serialized payload, re-sent to late joiners when latching.
    pub last_payload: Option<Vec<u8>>,
    pub last_publish_us: u64,
}

/// One subscription.
pub struct SubscriberSlot {
    pub topic: String,
    pub type_name: String,
    pub md5: String,
    pub schema: Arc<MessageSchema>,
    pub callback: SubscriberCallback,
    pub registered: bool,
    pub unregister_pending: bool,
    /// Publisher URIs the master reported, with their data channels.
    pub links: Vec<PublisherLink>,
}

/// One discovered publisher of a subscribed topic.
pub struct PublisherLink {
    pub uri: String,
    /// Peer arena reference once a channel exists.
    pub peer: Option<SlotRef>,
}

/// One provided service.
pub struct ProviderSlot {
    pub service: String,
    pub type_name: String,
    pub md5: String,
    pub request_schema: Arc<MessageSchema>,
    pub response_schema: Arc<MessageSchema>,
    pub handler: ServiceHandler,
    pub registered: bool,
    pub unregister_pending: bool,
}

/// One service-caller endpoint.
pub struct CallerSlot {
    pub service: String,
    pub type_name: String,
    pub md5: String,
    pub request_schema: Arc<MessageSchema>,
    pub response_schema: Arc<MessageSchema>,
    pub callback: CallerCallback,
    pub persistent: bool,
    /// Retry a call interrupted by a disconnect instead of failing it.
    pub retry_on_disconnect: bool,
    pub schedule: PeriodicSchedule,
    /// Open channel to the provider (persistent callers keep it).
    pub peer: Option<SlotRef>,
    /// Serialized request awaiting a connection or a response.
    pub pending_request: Option<Vec<u8>>,
    /// Deadline of the outstanding call; meaningful while a request is
    /// pending.
    pub call_deadline_us: u64,
    /// A lookupService is in flight for this slot.
    pub lookup_pending: bool,
}

// ============================================================================
// Options
// ============================================================================

/// Tuning for [`advertise`](crate::node::Node::advertise).
pub struct PublisherOptions {
    pub queue_size: usize,
    pub latching: bool,
    /// Microsecond period for loop-driven publishing; negative = on demand.
    pub period_us: i64,
    pub fill: Option<PublishFillCallback>,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            queue_size: 16,
            latching: false,
            period_us: crate::clock::PERIOD_ON_DEMAND,
            fill: None,
        }
    }
}

impl std::fmt::Debug for PublisherOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherOptions")
            .field("queue_size", &self.queue_size)
            .field("latching", &self.latching)
            .field("period_us", &self.period_us)
            .field("fill", &self.fill.is_some())
            .finish()
    }
}

/// Tuning for [`service_caller`](crate::node::Node::service_caller).
#[derive(Debug)]
pub struct CallerOptions {
    pub persistent: bool,
    pub retry_on_disconnect: bool,
    /// Microsecond period for loop-driven calls; negative = on demand.
    pub period_us: i64,
}

impl Default for CallerOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            retry_on_disconnect: false,
            period_us: crate::clock::PERIOD_ON_DEMAND,
        }
    }
}
