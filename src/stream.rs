//! Command streams.
//!
//! A [`CommandStream`] is an ordered list of commands executed by an
//! [`Interpreter`](crate::Interpreter). Streams are built on the driving
//! process, serialized with [`CommandStream::data`], moved to whichever
//! processes the routing selects and rebuilt there with
//! [`CommandStream::set_data`].
//!
//! ```
//! use pmconnect::{CommandStream, ObjectHandle, Value};
//!
//! let sphere = ObjectHandle(100);
//! let mut stream = CommandStream::new();
//! stream.new_object("Counter", sphere);
//! stream.invoke(sphere, "Add").arg(2).arg(3).end();
//!
//! let copy = CommandStream::from_data(&stream.data().unwrap()).unwrap();
//! assert_eq!(copy, stream);
//! assert_eq!(copy.argument(1, 0), Some(&Value::Int(2)));
//! ```

use crate::codec;
use crate::error::Error;
use crate::ids::ObjectHandle;
use bincode::{Decode, Encode};

/// Argument or result value carried by a command.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Handle(ObjectHandle),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<ObjectHandle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectHandle> for Value {
    fn from(v: ObjectHandle) -> Self {
        Value::Handle(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A single record of a [`CommandStream`].
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Command {
    /// Instantiate `class` and bind it to `handle`.
    New { class: String, handle: ObjectHandle },
    /// Call `method` on the object bound to `target`.
    Invoke {
        target: ObjectHandle,
        method: String,
        args: Vec<Value>,
    },
    /// Destroy the object bound to `handle`.
    Delete { handle: ObjectHandle },
    /// Values produced by the last invoke. Only found in result streams.
    Reply { values: Vec<Value> },
    /// An invoke failed. Only found in result streams.
    Error { message: String },
}

/// Ordered, appendable sequence of commands.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct CommandStream {
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a stream from bytes produced by [`Self::data`].
    pub fn from_data(data: &[u8]) -> Result<Self, Error> {
        let mut stream = Self::new();
        stream.set_data(data)?;
        Ok(stream)
    }

    /// Appends a `New` command.
    pub fn new_object(&mut self, class: &str, handle: ObjectHandle) -> &mut Self {
        self.commands.push(Command::New {
            class: class.to_string(),
            handle,
        });
        self
    }

    /// Starts an `Invoke` command. Arguments are appended with
    /// [`InvokeBuilder::arg`] and the command is committed by
    /// [`InvokeBuilder::end`].
    pub fn invoke(&mut self, target: ObjectHandle, method: &str) -> InvokeBuilder<'_> {
        InvokeBuilder {
            stream: self,
            target,
            method: method.to_string(),
            args: Vec::new(),
        }
    }

    /// Appends a `Delete` command.
    pub fn delete_object(&mut self, handle: ObjectHandle) -> &mut Self {
        self.commands.push(Command::Delete { handle });
        self
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Removes every command.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    /// Serializes the stream.
    pub fn data(&self) -> Result<Vec<u8>, Error> {
        codec::encode(self)
    }

    /// Replaces the contents with a stream decoded from `data`.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        *self = codec::decode(data)?;
        Ok(())
    }

    /// Argument `arg` of command `command`. For `Reply` commands this indexes
    /// the returned values.
    pub fn argument(&self, command: usize, arg: usize) -> Option<&Value> {
        match self.commands.get(command)? {
            Command::Invoke { args, .. } => args.get(arg),
            Command::Reply { values } => values.get(arg),
            _ => None,
        }
    }

    /// Number of arguments of command `command`.
    pub fn number_of_arguments(&self, command: usize) -> usize {
        match self.commands.get(command) {
            Some(Command::Invoke { args, .. }) => args.len(),
            Some(Command::Reply { values }) => values.len(),
            _ => 0,
        }
    }

    /// Builds a result stream holding one `Reply`.
    pub fn reply(values: Vec<Value>) -> Self {
        Self {
            commands: vec![Command::Reply { values }],
        }
    }

    /// Builds a result stream holding one `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            commands: vec![Command::Error {
                message: message.into(),
            }],
        }
    }

    /// The error message if this is an error result.
    pub fn error_message(&self) -> Option<&str> {
        match self.commands.first() {
            Some(Command::Error { message }) => Some(message),
            _ => None,
        }
    }
}

/// Pending `Invoke` command; see [`CommandStream::invoke`].
#[must_use = "call end() to append the command"]
pub struct InvokeBuilder<'a> {
    stream: &'a mut CommandStream,
    target: ObjectHandle,
    method: String,
    args: Vec<Value>,
}

impl<'a> InvokeBuilder<'a> {
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends the command to the stream.
    pub fn end(self) -> &'a mut CommandStream {
        self.stream.commands.push(Command::Invoke {
            target: self.target,
            method: self.method,
            args: self.args,
        });
        self.stream
    }
}
