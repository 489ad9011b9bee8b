//! In-memory bus used by unit tests.
//!
//! Keeps a property table, answers `Properties.Get`/`Set` from it, records
//! every peer call, and lets tests inject `PropertiesChanged` signals.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    AgentHandler, BusClient, BusError, ManagedObject, MatchRule, Signal, Subscription,
    SubscriptionId, Value, PROPERTIES_IFACE,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub path: String,
    pub iface: String,
    pub method: String,
    pub args: Vec<Value>,
}

type PropertyKey = (String, String, String);

#[derive(Default)]
struct State {
    properties: BTreeMap<PropertyKey, Value>,
    calls: Vec<RecordedCall>,
    hangs: Vec<String>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, BusError>,
    subscriptions: HashMap<u64, (MatchRule, mpsc::Sender<Signal>)>,
    next_subscription: u64,
    removed: Vec<SubscriptionId>,
    agent: Option<(String, Arc<dyn AgentHandler>)>,
    disconnected: bool,
}

pub struct FakeBus {
    state: Mutex<State>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
        })
    }

    /// Seed or overwrite a property without recording a call.
    pub fn set(&self, path: &str, iface: &str, name: &str, value: Value) {
        self.state.lock().properties.insert(
            (path.to_string(), iface.to_string(), name.to_string()),
            value,
        );
    }

    pub fn get(&self, path: &str, iface: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .properties
            .get(&(path.to_string(), iface.to_string(), name.to_string()))
            .cloned()
    }

    /// Seed a `Device1` object.
    pub fn add_device(&self, path: &str, address: &str, connected: bool, paired: bool) {
        let iface = "org.bluez.Device1";
        self.set(path, iface, "Address", Value::Str(address.to_string()));
        self.set(path, iface, "Alias", Value::Str(format!("dev {}", address)));
        self.set(path, iface, "Connected", Value::Bool(connected));
        self.set(path, iface, "Paired", Value::Bool(paired));
        self.set(path, iface, "Trusted", Value::Bool(false));
    }

    /// Never answer calls to `key` (a method name, or `Set:<Property>`).
    pub fn hang_on(&self, key: &str) {
        self.state.lock().hangs.push(key.to_string());
    }

    /// Answer calls to `key` only after `delay`.
    ///
    /// `GetManagedObjects` takes its snapshot before the delay, so the reply
    /// can be stale by the time it arrives.
    pub fn delay_on(&self, key: &str, delay: Duration) {
        self.state.lock().delays.insert(key.to_string(), delay);
    }

    /// Answer calls to `key` (a method name, or `Set:<Property>`) with `err`.
    pub fn fail_on(&self, key: &str, err: BusError) {
        self.state.lock().failures.insert(key.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.hangs.clear();
        state.delays.clear();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Values written to `iface.name` through `Properties.Set`, in order.
    pub fn property_sets(&self, iface: &str, name: &str) -> Vec<Value> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == "Set")
            .filter(|c| {
                c.args.first().and_then(Value::as_str) == Some(iface)
                    && c.args.get(1).and_then(Value::as_str) == Some(name)
            })
            .filter_map(|c| c.args.get(2).cloned().map(Value::into_inner))
            .collect()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn removed_subscriptions(&self) -> Vec<SubscriptionId> {
        self.state.lock().removed.clone()
    }

    pub fn agent(&self) -> Option<(String, Arc<dyn AgentHandler>)> {
        self.state.lock().agent.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    /// Update a property and deliver the matching `PropertiesChanged`.
    ///
    /// Returns how many subscribers received it.
    pub fn emit_changed(&self, path: &str, iface: &str, name: &str, value: Value) -> usize {
        self.set(path, iface, name, value.clone());
        let signal = Signal {
            path: path.to_string(),
            interface: iface.to_string(),
            changed: HashMap::from([(name.to_string(), value)]),
        };
        self.emit(signal)
    }

    pub fn emit(&self, signal: Signal) -> usize {
        let state = self.state.lock();
        state
            .subscriptions
            .values()
            .filter(|(rule, _)| rule.matches(&signal))
            .filter(|(_, tx)| tx.try_send(signal.clone()).is_ok())
            .count()
    }

    fn record(&self, path: &str, iface: &str, method: &str, args: &[Value]) {
        self.state.lock().calls.push(RecordedCall {
            path: path.to_string(),
            iface: iface.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        });
    }

    /// Delay, hang or fail according to the configured behaviour for `keys`.
    async fn behaviour(&self, keys: &[String]) -> Result<(), BusError> {
        let (delay, hang, failure) = {
            let state = self.state.lock();
            let delay = keys.iter().find_map(|k| state.delays.get(k).copied());
            let hang = keys.iter().any(|k| state.hangs.contains(k));
            let failure = keys.iter().find_map(|k| state.failures.get(k).cloned());
            (delay, hang, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BusClient for FakeBus {
    async fn call_method(
        &self,
        _destination: &str,
        path: &str,
        iface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError> {
        self.record(path, iface, method, &args);

        let mut keys = vec![method.to_string()];
        if iface == PROPERTIES_IFACE {
            if let Some(name) = args.get(1).and_then(Value::as_str) {
                keys.push(format!("{}:{}", method, name));
            }
        }
        self.behaviour(&keys).await?;

        if iface != PROPERTIES_IFACE {
            return Ok(vec![]);
        }

        let target = args.first().and_then(Value::as_str).unwrap_or_default();
        let name = args.get(1).and_then(Value::as_str).unwrap_or_default();
        let key = (path.to_string(), target.to_string(), name.to_string());

        match method {
            "Get" => match self.state.lock().properties.get(&key) {
                Some(value) => Ok(vec![Value::variant(value.clone())]),
                None => Err(BusError::Rejected {
                    name: "org.freedesktop.DBus.Error.InvalidArgs".into(),
                    message: format!("No such property '{}'", name),
                }),
            },
            "Set" => {
                let value = args
                    .get(2)
                    .cloned()
                    .map(Value::into_inner)
                    .ok_or_else(|| BusError::Protocol("Set without value".into()))?;
                self.state.lock().properties.insert(key, value);
                Ok(vec![])
            }
            _ => Ok(vec![]),
        }
    }

    async fn managed_objects(&self, _destination: &str) -> Result<Vec<ManagedObject>, BusError> {
        self.record("/", super::OBJECT_MANAGER_IFACE, "GetManagedObjects", &[]);

        let mut objects: BTreeMap<String, ManagedObject> = BTreeMap::new();
        for ((path, iface, name), value) in &self.state.lock().properties {
            let object = objects.entry(path.clone()).or_insert_with(|| ManagedObject {
                path: path.clone(),
                interfaces: HashMap::new(),
            });
            object
                .interfaces
                .entry(iface.clone())
                .or_default()
                .insert(name.clone(), value.clone());
        }

        self.behaviour(&["GetManagedObjects".to_string()]).await?;
        Ok(objects.into_values().collect())
    }

    async fn add_match(
        &self,
        rule: &MatchRule,
        capacity: usize,
    ) -> Result<Subscription, BusError> {
        self.record("/org/freedesktop/DBus", "org.freedesktop.DBus", "AddMatch", &[
            Value::Str(rule.to_string()),
        ]);
        self.behaviour(&["AddMatch".to_string()]).await?;

        let (tx, rx) = mpsc::channel(capacity);
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(id, (rule.clone(), tx));
        Ok(Subscription {
            id: SubscriptionId(id),
            signals: rx,
        })
    }

    async fn remove_match(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.record(
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "RemoveMatch",
            &[],
        );
        let mut state = self.state.lock();
        state.subscriptions.remove(&id.0);
        state.removed.push(id);
        Ok(())
    }

    async fn export_agent(
        &self,
        path: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), BusError> {
        self.state.lock().agent = Some((path.to_string(), handler));
        Ok(())
    }

    async fn unexport_agent(&self, _path: &str) -> Result<(), BusError> {
        self.state.lock().agent = None;
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}
