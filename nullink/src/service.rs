//! The service registry and the per-call dispatch pipeline.

use std::collections::HashMap;

use nullink_idl::{Interface, Member, TypeSpec};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::message::{CallMode, Message, Reply};

pub(crate) const SERVICE_INTERFACE: &str = "org.varlink.service";
pub(crate) const INTERFACE_NOT_FOUND: &str = "org.varlink.service.InterfaceNotFound";
pub(crate) const METHOD_NOT_FOUND: &str = "org.varlink.service.MethodNotFound";
pub(crate) const METHOD_NOT_IMPLEMENTED: &str = "org.varlink.service.MethodNotImplemented";
pub(crate) const INVALID_PARAMETER: &str = "org.varlink.service.InvalidParameter";
pub(crate) const INTERNAL_ERROR: &str = "org.varlink.service.InternalError";

const SERVICE_DESCRIPTION: &str = r#"# The Varlink Service Interface is provided by every varlink service. It
# describes the service and the interfaces it implements.
interface org.varlink.service

# Get a list of all the interfaces a service provides and information
# about the implementation.
method GetInfo() -> (
  vendor: string,
  product: string,
  version: string,
  url: string,
  interfaces: []string
)

# Get the description of an interface that is implemented by this service.
method GetInterfaceDescription(interface: string) -> (description: string)

# The requested interface was not found.
error InterfaceNotFound (interface: string)

# The requested method was not found
error MethodNotFound (method: string)

# The interface defines the requested method, but the service does not
# implement it.
error MethodNotImplemented (method: string)

# One of the passed parameters is invalid.
error InvalidParameter (parameter: string)
"#;

/// What `org.varlink.service.GetInfo` returns.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ServiceInfo {
    pub vendor: String,
    pub product: String,
    pub version: String,
    pub url: String,
    pub interfaces: Vec<String>,
}

pub type SyncHandler = Box<dyn Fn(&Value, CallMode) -> Result<Value> + Send + Sync>;
pub type StreamingHandler = Box<dyn Fn(&Value, CallMode, &mut Call<'_>) -> Result<()> + Send + Sync>;

/// How a registered method is implemented.
pub enum MethodHandler {
    /// Computes one reply object from the call parameters.
    Sync(SyncHandler),
    /// Emits any number of replies through the [`Call`] it is handed.
    Streaming(StreamingHandler),
}

impl MethodHandler {
    pub fn sync<F>(f: F) -> MethodHandler
    where
        F: Fn(&Value, CallMode) -> Result<Value> + Send + Sync + 'static,
    {
        MethodHandler::Sync(Box::new(f))
    }

    pub fn streaming<F>(f: F) -> MethodHandler
    where
        F: Fn(&Value, CallMode, &mut Call<'_>) -> Result<()> + Send + Sync + 'static,
    {
        MethodHandler::Streaming(Box::new(f))
    }
}

type ReplySink<'a> = &'a mut dyn FnMut(Reply) -> Result<()>;

/// The reply sink handed to streaming handlers.
///
/// Intermediate replies go through [`Call::reply`], the final one through
/// [`Call::close`]. Every emission is validated against the method's return
/// type. For a `oneway` call the first emission completes the call and
/// everything is discarded; for a call that did not ask for `more`, emitting
/// an intermediate reply is answered with `MethodNotImplemented`.
pub struct Call<'a> {
    sink: ReplySink<'a>,
    iface: &'a Interface,
    return_spec: &'a TypeSpec,
    mode: CallMode,
    full_method: &'a str,
    closed: bool,
    broken: bool,
}

impl Call<'_> {
    pub fn mode(&self) -> CallMode {
        self.mode
    }

    /// True if this call accepts more than one reply.
    pub fn wants_more(&self) -> bool {
        self.mode == CallMode::More
    }

    /// Send an intermediate reply; the call stays open.
    pub fn reply(&mut self, parameters: Value) -> Result<()> {
        self.emit(parameters, true)
    }

    /// Send the final reply.
    pub fn close(&mut self, parameters: Value) -> Result<()> {
        self.emit(parameters, false)
    }

    fn emit(&mut self, parameters: Value, continues: bool) -> Result<()> {
        if self.closed {
            if self.mode == CallMode::Oneway {
                return Ok(());
            }
            return Err(Error::InvalidArgument(format!(
                "reply after the final reply of `{}`",
                self.full_method
            )));
        }

        if let Err(e) = self.iface.validate(&parameters, self.return_spec) {
            self.closed = true;
            self.deliver(Reply::error(
                INVALID_PARAMETER,
                json!({ "parameter": e.parameter }),
            ))?;
            return Err(Error::InvalidParameter(e.parameter));
        }

        match self.mode {
            CallMode::Oneway => {
                self.closed = true;
                Ok(())
            }
            CallMode::More => {
                if !continues {
                    self.closed = true;
                }
                self.deliver(Reply {
                    continues: Some(continues),
                    error: None,
                    parameters: Some(parameters),
                })
            }
            CallMode::Basic | CallMode::Upgrade => {
                self.closed = true;
                if continues {
                    self.deliver(Reply::error(
                        METHOD_NOT_IMPLEMENTED,
                        json!({ "method": self.full_method }),
                    ))?;
                    Err(Error::MethodNotImplemented(self.full_method.into()))
                } else {
                    self.deliver(Reply::parameters(parameters))
                }
            }
        }
    }

    fn deliver(&mut self, reply: Reply) -> Result<()> {
        (self.sink)(reply).map_err(|e| {
            self.broken = true;
            e
        })
    }
}

struct InterfaceEntry {
    spec: Interface,
    handlers: HashMap<String, MethodHandler>,
}

/// A varlink service: a description plus an ordered set of interfaces with
/// their method handlers.
///
/// `org.varlink.service` is installed first at construction; its `GetInfo`
/// and `GetInterfaceDescription` methods are served by the registry itself.
pub struct Service {
    vendor: String,
    product: String,
    version: String,
    url: String,
    interfaces: Vec<InterfaceEntry>,
}

impl Service {
    pub fn new<S: Into<String>>(vendor: S, product: S, version: S, url: S) -> Service {
        let spec = Interface::from_description(SERVICE_DESCRIPTION)
            .expect("the org.varlink.service definition is valid");
        Service {
            vendor: vendor.into(),
            product: product.into(),
            version: version.into(),
            url: url.into(),
            interfaces: vec![InterfaceEntry {
                spec,
                handlers: HashMap::new(),
            }],
        }
    }

    /// Parse `description` and install it with its method handlers.
    ///
    /// Fails if the interface name is taken or a handler names a method the
    /// schema does not define. Must not be called once the service is
    /// dispatching; sessions read the registry unsynchronized.
    pub fn add_interface(
        &mut self,
        description: &str,
        handlers: HashMap<String, MethodHandler>,
    ) -> Result<()> {
        let spec = Interface::from_description(description)?;
        self.add_interface_spec(spec, handlers)
    }

    /// Install an already parsed interface.
    pub fn add_interface_spec(
        &mut self,
        spec: Interface,
        handlers: HashMap<String, MethodHandler>,
    ) -> Result<()> {
        if self.find_interface(&spec.name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "interface `{}` is already registered",
                spec.name
            )));
        }
        for name in handlers.keys() {
            if spec.method(name).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "handler for unknown method `{}.{}`",
                    spec.name, name
                )));
            }
        }
        self.interfaces.push(InterfaceEntry { spec, handlers });
        Ok(())
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            vendor: self.vendor.clone(),
            product: self.product.clone(),
            version: self.version.clone(),
            url: self.url.clone(),
            interfaces: self.interfaces.iter().map(|e| e.spec.name.clone()).collect(),
        }
    }

    /// The parsed schema of an installed interface.
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.find_interface(name).map(|e| &e.spec)
    }

    fn find_interface(&self, name: &str) -> Option<&InterfaceEntry> {
        self.interfaces.iter().find(|e| e.spec.name == name)
    }

    /// Dispatch one call, delivering every reply through `sink` in emission
    /// order.
    ///
    /// Protocol failures (unknown interface or method, invalid parameters,
    /// handler errors) become error replies and return `Ok`; only sink
    /// (transport) failures surface as `Err`.
    pub fn process_call(
        &self,
        message: &Message,
        sink: &mut dyn FnMut(Reply) -> Result<()>,
    ) -> Result<()> {
        // A oneway request produces no reply, not even an error reply.
        let oneway = message.is_oneway();
        let mut guarded = move |reply: Reply| -> Result<()> {
            if oneway {
                Ok(())
            } else {
                sink(reply)
            }
        };

        let ifname = message.interface();
        let Some(entry) = self.find_interface(ifname) else {
            tracing::debug!(interface = ifname, "call to unknown interface");
            return guarded(Reply::error(
                INTERFACE_NOT_FOUND,
                json!({ "interface": ifname }),
            ));
        };

        let Some(Member::Method {
            parameters: param_spec,
            return_value: return_spec,
            ..
        }) = entry.spec.method(message.method())
        else {
            return guarded(Reply::error(
                METHOD_NOT_FOUND,
                json!({ "method": message.full_method() }),
            ));
        };

        if let Err(e) = entry.spec.validate(message.parameters(), param_spec) {
            return guarded(Reply::error(
                INVALID_PARAMETER,
                json!({ "parameter": e.parameter }),
            ));
        }

        if entry.spec.name == SERVICE_INTERFACE {
            let result = self.service_call(message);
            return finish_sync(result, &entry.spec, return_spec, message, &mut guarded);
        }

        match entry.handlers.get(message.method()) {
            None => guarded(Reply::error(
                METHOD_NOT_IMPLEMENTED,
                json!({ "method": message.full_method() }),
            )),
            Some(MethodHandler::Sync(f)) => {
                let result = f(message.parameters(), message.mode());
                finish_sync(result, &entry.spec, return_spec, message, &mut guarded)
            }
            Some(MethodHandler::Streaming(f)) => {
                let mut call = Call {
                    sink: &mut guarded,
                    iface: &entry.spec,
                    return_spec,
                    mode: message.mode(),
                    full_method: message.full_method(),
                    closed: false,
                    broken: false,
                };
                let result = f(message.parameters(), message.mode(), &mut call);
                let (closed, broken) = (call.closed, call.broken);

                match result {
                    Ok(()) => {
                        if !closed && message.mode() != CallMode::Oneway {
                            return guarded(Reply::error(
                                INTERNAL_ERROR,
                                json!({ "what": format!(
                                    "method `{}` returned no reply",
                                    message.full_method()
                                ) }),
                            ));
                        }
                        Ok(())
                    }
                    // The write path failed; the session has to close.
                    Err(e) if broken => Err(e),
                    // An error reply or the final reply is already out.
                    Err(_) if closed => Ok(()),
                    Err(Error::VarlinkError { name, parameters }) => {
                        guarded(Reply::error(name, parameters))
                    }
                    Err(e) => guarded(Reply::error(
                        INTERNAL_ERROR,
                        json!({ "what": e.to_string() }),
                    )),
                }
            }
        }
    }

    fn service_call(&self, message: &Message) -> Result<Value> {
        match message.method() {
            "GetInfo" => Ok(serde_json::to_value(self.info())?),
            "GetInterfaceDescription" => {
                let name = message.parameters()["interface"].as_str().unwrap_or_default();
                match self.find_interface(name) {
                    Some(entry) => Ok(json!({ "description": entry.spec.to_string() })),
                    None => Err(Error::varlink(
                        INTERFACE_NOT_FOUND,
                        json!({ "interface": name }),
                    )),
                }
            }
            other => Err(Error::MethodNotFound(format!(
                "{}.{}",
                SERVICE_INTERFACE, other
            ))),
        }
    }
}

fn finish_sync(
    result: Result<Value>,
    iface: &Interface,
    return_spec: &TypeSpec,
    message: &Message,
    sink: &mut dyn FnMut(Reply) -> Result<()>,
) -> Result<()> {
    match result {
        Ok(ret) => {
            if let Err(e) = iface.validate(&ret, return_spec) {
                tracing::warn!(
                    method = message.full_method(),
                    parameter = %e.parameter,
                    "handler return value failed validation"
                );
                return sink(Reply::error(
                    INVALID_PARAMETER,
                    json!({ "parameter": e.parameter }),
                ));
            }
            match message.mode() {
                CallMode::Oneway => Ok(()),
                CallMode::More => sink(Reply {
                    continues: Some(false),
                    error: None,
                    parameters: Some(ret),
                }),
                CallMode::Basic | CallMode::Upgrade => sink(Reply::parameters(ret)),
            }
        }
        Err(Error::VarlinkError { name, parameters }) => sink(Reply::error(name, parameters)),
        Err(e) => sink(Reply::error(
            INTERNAL_ERROR,
            json!({ "what": e.to_string() }),
        )),
    }
}
