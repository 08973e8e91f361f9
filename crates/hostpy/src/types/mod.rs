//! Object types behind the reference-counted `Value` variants.

mod class;
mod dict;
mod function;
mod generator;
mod iter;
mod module;

use std::{future::Future, pin::Pin};

pub use class::{Class, Descriptor, Instance, SuperObj};
pub use dict::Dict;
pub use function::{BoundMethod, BuiltinMethod, Coroutine, Function, NativeFn, NativeFunction};
pub use generator::{AsyncGenerator, Generator, WeakAsyncGenerator};
pub(crate) use generator::{GenChannel, GenCore, GenStep, Resume, stop_iteration};
pub use iter::PyIter;
pub(crate) use iter::IterStep;
pub use module::{HostProxy, ModuleFallback, ModuleObj};

/// A boxed, non-`Send` future. Every statement and expression evaluates to one of these.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
