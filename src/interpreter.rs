//! Local execution of command streams.
//!
//! The [`Interpreter`] owns an explicit handle table of [`RemoteObject`]s.
//! Objects are created from a [`ClassRegistry`] that maps class names to
//! constructor functions, so nothing is instantiated by reflection. Extension
//! modules are likewise explicit: a [`ModuleRegistry`] maps module names to
//! initializers that register more classes when loaded.

use crate::error::Error;
use crate::ids::ObjectHandle;
use crate::progress::ProgressObserver;
use crate::stream::{Command, CommandStream, Value};
use downcast_rs::{impl_downcast, Downcast};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use tracing::{debug, instrument, trace, warn};

// ============================================================================
// RemoteObject Trait
// ============================================================================

/// An object that command streams can create, invoke and delete.
pub trait RemoteObject: Debug + Downcast {
    /// Name the class was registered under.
    fn class_name(&self) -> &str;

    /// Executes `method`. The returned values become the interpreter's last
    /// result.
    fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        ctx: &mut InvokeContext<'_>,
    ) -> Result<Vec<Value>, Error>;
}

impl_downcast!(RemoteObject);

/// Per-invoke view of the executing process.
pub struct InvokeContext<'a> {
    pub handle: ObjectHandle,
    pub partition_id: i32,
    pub number_of_partitions: i32,
    progress: &'a mut dyn ProgressObserver,
}

impl InvokeContext<'_> {
    /// Reports progress of the running method. `fraction` is 0.0 to 1.0.
    pub fn report_progress(&mut self, fraction: f64, text: &str) {
        self.progress.report(self.handle, fraction, text);
    }
}

// ============================================================================
// ClassRegistry
// ============================================================================

/// Constructor stored in a [`ClassRegistry`].
pub type ObjectConstructor = fn() -> Box<dyn RemoteObject>;

/// Maps class names to constructors.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    constructors: HashMap<String, ObjectConstructor>,
}

/// Registers a `Default`-constructible [`RemoteObject`] type under its type
/// name.
///
/// ```
/// use pmconnect::{register_class, ClassRegistry, InvokeContext, RemoteObject, Value, Error};
///
/// #[derive(Debug, Default)]
/// struct Echo;
///
/// impl RemoteObject for Echo {
///     fn class_name(&self) -> &str { "Echo" }
///     fn invoke(&mut self, _m: &str, args: &[Value], _c: &mut InvokeContext<'_>)
///         -> Result<Vec<Value>, Error> { Ok(args.to_vec()) }
/// }
///
/// let mut classes = ClassRegistry::new();
/// register_class!(classes, Echo);
/// assert!(classes.contains("Echo"));
/// ```
#[macro_export]
macro_rules! register_class {
    ($registry:expr, $type:ty) => {
        $registry.register(stringify!($type), || {
            Box::new(<$type>::default()) as Box<dyn $crate::RemoteObject>
        })
    };
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: &str, constructor: ObjectConstructor) -> &mut Self {
        debug!(class, "Registering class");
        self.constructors.insert(class.to_string(), constructor);
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    pub fn create(&self, class: &str) -> Result<Box<dyn RemoteObject>, Error> {
        let constructor = self
            .constructors
            .get(class)
            .ok_or_else(|| Error::UnknownClass(class.to_string()))?;
        Ok(constructor())
    }
}

impl Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

// ============================================================================
// ModuleRegistry
// ============================================================================

/// Initializer of an extension module. Registers the module's classes.
pub type ModuleInitializer = fn(&mut ClassRegistry) -> Result<(), Error>;

/// Extension modules that can be loaded by name.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleInitializer>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, initializer: ModuleInitializer) -> &mut Self {
        debug!(name, "Registering module");
        self.modules.insert(name.to_string(), initializer);
        self
    }

    pub fn get(&self, name: &str) -> Option<ModuleInitializer> {
        self.modules.get(name).copied()
    }
}

impl Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.modules.keys()).finish()
    }
}

// ============================================================================
// ObjectTable
// ============================================================================

/// Handle-to-object table.
#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: HashMap<ObjectHandle, Box<dyn RemoteObject>>,
}

impl ObjectTable {
    pub fn insert(&mut self, handle: ObjectHandle, object: Box<dyn RemoteObject>) -> Result<(), Error> {
        if handle == ObjectHandle::NULL || self.objects.contains_key(&handle) {
            return Err(Error::HandleInUse(handle.0));
        }
        self.objects.insert(handle, object);
        Ok(())
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&dyn RemoteObject> {
        self.objects.get(&handle).map(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut Box<dyn RemoteObject>> {
        self.objects.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Option<Box<dyn RemoteObject>> {
        self.objects.remove(&handle)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

// ============================================================================
// ProcessModule
// ============================================================================

/// Built-in object bound to [`ObjectHandle::PROCESS_MODULE`].
#[derive(Debug, Default)]
pub struct ProcessModule {
    pub partition_id: i32,
    pub number_of_partitions: i32,
}

impl RemoteObject for ProcessModule {
    fn class_name(&self) -> &str {
        "ProcessModule"
    }

    fn invoke(
        &mut self,
        method: &str,
        _args: &[Value],
        _ctx: &mut InvokeContext<'_>,
    ) -> Result<Vec<Value>, Error> {
        match method {
            "GetPartitionId" => Ok(vec![Value::Int(self.partition_id.into())]),
            "GetNumberOfPartitions" => Ok(vec![Value::Int(self.number_of_partitions.into())]),
            _ => Err(Error::UnknownMethod {
                class: self.class_name().to_string(),
                method: method.to_string(),
            }),
        }
    }
}

// ============================================================================
// Interpreter
// ============================================================================

/// Executes command streams against a local object table.
#[derive(Debug)]
pub struct Interpreter {
    classes: ClassRegistry,
    modules: ModuleRegistry,
    loaded_modules: HashSet<String>,
    objects: ObjectTable,
    last_result: CommandStream,
    partition_id: i32,
    number_of_partitions: i32,
}

impl Interpreter {
    pub fn new(
        classes: ClassRegistry,
        modules: ModuleRegistry,
        partition_id: i32,
        number_of_partitions: i32,
    ) -> Self {
        let mut objects = ObjectTable::default();
        objects.objects.insert(
            ObjectHandle::PROCESS_MODULE,
            Box::new(ProcessModule {
                partition_id,
                number_of_partitions,
            }),
        );
        Self {
            classes,
            modules,
            loaded_modules: HashSet::new(),
            objects,
            last_result: CommandStream::new(),
            partition_id,
            number_of_partitions,
        }
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn number_of_partitions(&self) -> i32 {
        self.number_of_partitions
    }

    /// Result of the most recent invoke, or of the most recent failure.
    pub fn last_result(&self) -> &CommandStream {
        &self.last_result
    }

    pub fn object(&self, handle: ObjectHandle) -> Option<&dyn RemoteObject> {
        self.objects.get(handle)
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Executes every command of `stream` in order. Stops at the first failing
    /// command, which also becomes the last result.
    #[instrument(skip_all, fields(partition = self.partition_id, len = stream.len()))]
    pub fn process_stream(
        &mut self,
        stream: &CommandStream,
        progress: &mut dyn ProgressObserver,
    ) -> Result<(), Error> {
        for command in stream.commands() {
            if let Err(err) = self.process_command(command, progress) {
                warn!(?err, "Command failed");
                self.last_result = CommandStream::error(err.to_string());
                return Err(err);
            }
        }
        Ok(())
    }

    fn process_command(
        &mut self,
        command: &Command,
        progress: &mut dyn ProgressObserver,
    ) -> Result<(), Error> {
        match command {
            Command::New { class, handle } => {
                trace!(class, %handle, "New");
                let object = self.classes.create(class)?;
                self.objects.insert(*handle, object)
            }
            Command::Invoke {
                target,
                method,
                args,
            } => {
                trace!(%target, method, "Invoke");
                let object = self
                    .objects
                    .get_mut(*target)
                    .ok_or(Error::UnknownObject(target.0))?;
                let mut ctx = InvokeContext {
                    handle: *target,
                    partition_id: self.partition_id,
                    number_of_partitions: self.number_of_partitions,
                    progress,
                };
                let values = object.invoke(method, args, &mut ctx)?;
                self.last_result = CommandStream::reply(values);
                Ok(())
            }
            Command::Delete { handle } => {
                trace!(%handle, "Delete");
                if *handle == ObjectHandle::PROCESS_MODULE {
                    return Err(Error::HandleInUse(handle.0));
                }
                self.objects
                    .remove(*handle)
                    .map(|_| ())
                    .ok_or(Error::UnknownObject(handle.0))
            }
            Command::Reply { .. } | Command::Error { .. } => Err(Error::MalformedData(
                "result records cannot be executed".to_string(),
            )),
        }
    }

    /// Loads an extension module. Loading a module twice is a no-op.
    #[instrument(skip(self), fields(partition = self.partition_id))]
    pub fn load_module(&mut self, name: &str, directory: &str) -> Result<(), Error> {
        if self.loaded_modules.contains(name) {
            debug!("Module already loaded");
            return Ok(());
        }
        let initializer = self
            .modules
            .get(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))?;
        initializer(&mut self.classes)?;
        self.loaded_modules.insert(name.to_string());
        debug!("Module loaded");
        Ok(())
    }

    pub fn is_module_loaded(&self, name: &str) -> bool {
        self.loaded_modules.contains(name)
    }
}
