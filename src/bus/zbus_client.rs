//! [`BusClient`] implementation on the zbus system bus connection.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, StructureBuilder};
use zbus::{interface, Connection, Message, MessageStream};

use super::{
    AgentHandler, BusClient, BusError, ManagedObject, MatchRule, Signal, Subscription,
    SubscriptionId, Value, OBJECT_MANAGER_IFACE,
};

impl From<zbus::Error> for BusError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => BusError::Rejected {
                name: name.to_string(),
                message: message.unwrap_or_default(),
            },
            other => BusError::Transport(other.to_string()),
        }
    }
}

impl From<zvariant::Error> for BusError {
    fn from(err: zvariant::Error) -> Self {
        BusError::Protocol(err.to_string())
    }
}

/// Convert into a zvariant value for a message body.
fn to_zvalue(value: &Value) -> Result<zvariant::Value<'static>, BusError> {
    Ok(match value {
        Value::Bool(b) => zvariant::Value::Bool(*b),
        Value::Str(s) => zvariant::Value::from(s.clone()),
        Value::U32(n) => zvariant::Value::U32(*n),
        Value::ObjectPath(p) => zvariant::Value::ObjectPath(ObjectPath::try_from(p.clone())?),
        Value::Variant(inner) => zvariant::Value::Value(Box::new(to_zvalue(inner)?)),
    })
}

/// Convert from a zvariant value; types the backends never read are dropped.
fn from_zvalue(value: &zvariant::Value<'_>) -> Option<Value> {
    match value {
        zvariant::Value::Bool(b) => Some(Value::Bool(*b)),
        zvariant::Value::Str(s) => Some(Value::Str(s.to_string())),
        zvariant::Value::U32(n) => Some(Value::U32(*n)),
        zvariant::Value::U16(n) => Some(Value::U32(u32::from(*n))),
        zvariant::Value::U8(n) => Some(Value::U32(u32::from(*n))),
        zvariant::Value::ObjectPath(p) => Some(Value::ObjectPath(p.to_string())),
        zvariant::Value::Value(inner) => from_zvalue(inner).map(Value::variant),
        _ => None,
    }
}

fn convert_properties(props: &HashMap<String, OwnedValue>) -> HashMap<String, Value> {
    props
        .iter()
        .filter_map(|(name, value)| from_zvalue(value).map(|v| (name.clone(), v)))
        .collect()
}

/// Parse a `PropertiesChanged` message into a [`Signal`].
fn parse_properties_changed(msg: &Message) -> Result<Signal, BusError> {
    let header = msg.header();
    let path = header
        .path()
        .ok_or_else(|| BusError::Protocol("signal without object path".into()))?
        .to_string();

    let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        msg.body().deserialize()?;

    Ok(Signal {
        path,
        interface,
        changed: convert_properties(&changed),
    })
}

/// Agent object exported on the bus, forwarding to an [`AgentHandler`].
struct AgentObject {
    handler: Arc<dyn AgentHandler>,
}

fn rejected(err: BusError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

#[interface(name = "org.bluez.Agent1")]
impl AgentObject {
    async fn release(&self) {
        self.handler.release().await
    }

    async fn request_pin_code(&self, device: OwnedObjectPath) -> zbus::fdo::Result<String> {
        self.handler
            .request_pin_code(device.as_str())
            .await
            .map_err(rejected)
    }

    async fn display_pin_code(&self, device: OwnedObjectPath, pincode: String) {
        self.handler.display_pin_code(device.as_str(), &pincode).await
    }

    async fn request_passkey(&self, device: OwnedObjectPath) -> zbus::fdo::Result<u32> {
        self.handler
            .request_passkey(device.as_str())
            .await
            .map_err(rejected)
    }

    async fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
        self.handler
            .display_passkey(device.as_str(), passkey, entered)
            .await
    }

    async fn request_confirmation(
        &self,
        device: OwnedObjectPath,
        passkey: u32,
    ) -> zbus::fdo::Result<()> {
        self.handler
            .request_confirmation(device.as_str(), passkey)
            .await
            .map_err(rejected)
    }

    async fn request_authorization(&self, device: OwnedObjectPath) -> zbus::fdo::Result<()> {
        self.handler
            .request_authorization(device.as_str())
            .await
            .map_err(rejected)
    }

    async fn authorize_service(
        &self,
        device: OwnedObjectPath,
        uuid: String,
    ) -> zbus::fdo::Result<()> {
        self.handler
            .authorize_service(device.as_str(), &uuid)
            .await
            .map_err(rejected)
    }

    async fn cancel(&self) {
        self.handler.cancel().await
    }
}

/// System bus client.
pub struct ZbusClient {
    connection: Connection,
    /// Forwarding tasks per subscription; aborting one drops its stream.
    subscriptions: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_subscription: AtomicU64,
}

impl ZbusClient {
    /// Connect to the system bus.
    pub async fn system() -> Result<Arc<Self>, BusError> {
        let connection = Connection::system().await?;
        info!(
            "Connected to system bus as {}",
            connection
                .unique_name()
                .map(|n| n.to_string())
                .unwrap_or_default()
        );
        Ok(Arc::new(Self::from_connection(connection)))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl BusClient for ZbusClient {
    async fn call_method(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError> {
        let reply = if args.is_empty() {
            self.connection
                .call_method(Some(destination), path, Some(iface), method, &())
                .await?
        } else {
            let body = args
                .iter()
                .try_fold(StructureBuilder::new(), |builder, arg| {
                    to_zvalue(arg).map(|v| builder.append_field(v))
                })?
                .build()?;
            self.connection
                .call_method(Some(destination), path, Some(iface), method, &body)
                .await?
        };

        let body = reply.body();
        if body.signature().to_string().is_empty() {
            return Ok(vec![]);
        }
        let fields: zvariant::Structure<'_> = body.deserialize()?;
        Ok(fields.fields().iter().filter_map(from_zvalue).collect())
    }

    async fn managed_objects(&self, destination: &str) -> Result<Vec<ManagedObject>, BusError> {
        let reply = self
            .connection
            .call_method(
                Some(destination),
                "/",
                Some(OBJECT_MANAGER_IFACE),
                "GetManagedObjects",
                &(),
            )
            .await?;

        let objects: HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>> =
            reply.body().deserialize()?;

        Ok(objects
            .into_iter()
            .map(|(path, interfaces)| ManagedObject {
                path: path.to_string(),
                interfaces: interfaces
                    .iter()
                    .map(|(iface, props)| (iface.clone(), convert_properties(props)))
                    .collect(),
            })
            .collect())
    }

    async fn add_match(
        &self,
        rule: &MatchRule,
        capacity: usize,
    ) -> Result<Subscription, BusError> {
        let rule_text = rule.to_string();
        let zbus_rule = zbus::MatchRule::try_from(rule_text.as_str())?;
        let mut stream =
            MessageStream::for_match_rule(zbus_rule, &self.connection, Some(capacity)).await?;

        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Signal stream error: {}", e);
                        continue;
                    }
                };
                match parse_properties_changed(&msg) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring malformed PropertiesChanged: {}", e),
                }
            }
        });

        debug!("AddMatch #{}: {}", id, rule_text);
        self.subscriptions.lock().insert(id, task);
        Ok(Subscription {
            id: SubscriptionId(id),
            signals: rx,
        })
    }

    async fn remove_match(&self, id: SubscriptionId) -> Result<(), BusError> {
        // Dropping the stream inside the task issues RemoveMatch.
        if let Some(task) = self.subscriptions.lock().remove(&id.0) {
            task.abort();
            debug!("RemoveMatch #{}", id.0);
        }
        Ok(())
    }

    async fn export_agent(
        &self,
        path: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), BusError> {
        let exported = self
            .connection
            .object_server()
            .at(path, AgentObject { handler })
            .await?;
        if !exported {
            debug!("Agent already exported at {}", path);
        }
        Ok(())
    }

    async fn unexport_agent(&self, path: &str) -> Result<(), BusError> {
        self.connection
            .object_server()
            .remove::<AgentObject, _>(path)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) {
        for (_, task) in self.subscriptions.lock().drain() {
            task.abort();
        }
        if let Err(e) = self.connection.clone().close().await {
            debug!("Closing bus connection: {}", e);
        }
    }
}
