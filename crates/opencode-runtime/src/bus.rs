use once_cell::sync::Lazy;
use std::fmt;
use schemars::{schema::RootSchema, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::instance::{Instance, InstanceState};
use crate::{Error, Result};

/// A typed event: a stable name plus a payload schema.
///
/// The payload type is the schema — typed publishes conform by
/// construction, raw publishes are validated against it before fan-out.
pub trait BusEvent: Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static {
    const NAME: &'static str;
}

type Handler = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;
type Validator = fn(&Value) -> std::result::Result<(), String>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<&'static str, Vec<(u64, Handler)>>,
    validators: HashMap<&'static str, Validator>,
}

/// Synchronous in-process pub/sub.
///
/// Events fire one-shot to all current subscribers in registration order;
/// nothing is buffered or replayed. A subscriber failure is logged and does
/// not prevent later subscribers. Two flavors exist: [`global()`] for
/// cross-scope signals, and a per-instance bus in the instance state cache.
pub struct Bus {
    inner: Arc<Mutex<BusInner>>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
        }
    }

    /// Register `E` so raw publishes to its name can be validated.
    /// Subscribing declares implicitly; declaring twice is harmless.
    pub fn declare<E: BusEvent>(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.validators.insert(E::NAME, validate_as::<E>);
    }

    /// Attach `f` to `E`. Returns a handle for explicit unsubscription;
    /// dropping the handle leaves the subscriber attached.
    pub fn subscribe<E: BusEvent>(
        &self,
        f: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: Handler = Arc::new(move |value: &Value| {
            let event: E = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
            f(&event);
            Ok(())
        });

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.validators.insert(E::NAME, validate_as::<E>);
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .entry(E::NAME)
            .or_default()
            .push((id, handler));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            name: E::NAME,
            id,
        }
    }

    /// Publish a typed payload. When this returns, every subscriber ran.
    pub fn publish<E: BusEvent>(&self, payload: &E) -> Result<()> {
        let value = serde_json::to_value(payload).map_err(|e| Error::InvalidEvent {
            name: E::NAME.to_string(),
            reason: e.to_string(),
        })?;
        self.dispatch(E::NAME, &value);
        Ok(())
    }

    /// Publish a raw JSON payload after validating it against the declared
    /// schema for `name`.
    pub fn publish_value(&self, name: &str, value: Value) -> Result<()> {
        let (resolved, validator) = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some((resolved, validator)) = inner.validators.get_key_value(name) else {
                return Err(Error::UnknownEvent(name.to_string()));
            };
            (*resolved, *validator)
        };

        validator(&value).map_err(|reason| Error::InvalidEvent {
            name: name.to_string(),
            reason,
        })?;
        self.dispatch(resolved, &value);
        Ok(())
    }

    /// Declared schema for `E`'s payload.
    pub fn schema<E: BusEvent>(&self) -> RootSchema {
        schemars::gen::SchemaGenerator::default().into_root_schema_for::<E>()
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.get(name).map_or(0, Vec::len)
    }

    fn dispatch(&self, name: &'static str, value: &Value) {
        // Snapshot outside the lock so handlers may subscribe or publish.
        let handlers: Vec<(u64, Handler)> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.get(name).cloned().unwrap_or_default()
        };

        for (id, handler) in handlers {
            if let Err(reason) = handler(value) {
                tracing::warn!(event = name, subscriber = id, error = %reason, "subscriber failed");
            }
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

// The per-instance flavor: one bus per scope, built on first access.
impl InstanceState for Bus {
    fn init(_instance: &Instance) -> Result<Self> {
        Ok(Bus::new())
    }
}

fn validate_as<E: BusEvent>(value: &Value) -> std::result::Result<(), String> {
    serde_json::from_value::<E>(value.clone())
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Unsubscribe handle returned by [`Bus::subscribe`].
pub struct Subscription {
    bus: Weak<Mutex<BusInner>>,
    name: &'static str,
    id: u64,
}

impl Subscription {
    /// Detach the subscriber. A handle that outlives its bus is a no-op.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handlers) = inner.subscribers.get_mut(self.name) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Process-global bus for signals that must cross instance scopes.
pub fn global() -> &'static Bus {
    static GLOBAL: Lazy<Bus> = Lazy::new(Bus::new);
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize, JsonSchema)]
    struct Ping {
        seq: u64,
    }

    impl BusEvent for Ping {
        const NAME: &'static str = "test.ping";
    }

    #[test]
    fn test_publish_reaches_subscribers_in_order() {
        let bus = Bus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = log.clone();
        let _a = bus.subscribe::<Ping>(move |e| first.lock().unwrap().push(("a", e.seq)));
        let second = log.clone();
        let _b = bus.subscribe::<Ping>(move |e| second.lock().unwrap().push(("b", e.seq)));

        bus.publish(&Ping { seq: 1 }).unwrap();
        assert_eq!(*log.lock().unwrap(), [("a", 1), ("b", 1)]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let sub = bus.subscribe::<Ping>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&Ping { seq: 1 }).unwrap();
        sub.unsubscribe();
        bus.publish(&Ping { seq: 2 }).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_raw_publish_validates_schema() {
        let bus = Bus::new();
        bus.declare::<Ping>();

        assert!(bus
            .publish_value("test.ping", serde_json::json!({"seq": 3}))
            .is_ok());

        let err = bus
            .publish_value("test.ping", serde_json::json!({"seq": "not a number"}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));

        let err = bus
            .publish_value("test.unknown", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEvent(_)));
    }

    #[test]
    fn test_failed_subscriber_does_not_block_later_ones() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        // Subscriber demanding a field the payload lacks: its decode fails
        // and must be isolated from the subscriber after it.
        #[derive(Debug, Serialize, serde::Deserialize, JsonSchema)]
        struct StrictPing {
            seq: u64,
            origin: String,
        }
        impl BusEvent for StrictPing {
            const NAME: &'static str = "test.ping";
        }

        let _strict = bus.subscribe::<StrictPing>(|_| {});
        let seen = count.clone();
        let _loose = bus.subscribe::<Ping>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&Ping { seq: 7 }).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schema_exposes_payload_shape() {
        let bus = Bus::new();
        let schema = serde_json::to_value(bus.schema::<Ping>()).unwrap();
        assert!(schema["properties"].get("seq").is_some());
    }

    #[test]
    fn test_global_bus_is_shared() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = global().subscribe::<Ping>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        global().publish(&Ping { seq: 9 }).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sub.unsubscribe();
    }
}
