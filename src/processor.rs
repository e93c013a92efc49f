// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Realtime processor capability: a periodic `process` callback plus static
// parameter metadata, constructed by name through a registry of factories.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

/// One processing quantum as seen by a processor.
#[derive(Debug)]
pub struct Quantum<'a> {
    /// Number of quanta rendered before this one.
    pub index: u64,
    pub sample_rate: u32,
    pub inputs: &'a [f32],
    pub outputs: &'a mut [f32],
    /// Current value of each declared parameter, in descriptor order.
    pub params: &'a [f32],
}

/// Ticked once per quantum on the render thread.
///
/// `process` must not block; returning `false` asks the host to stop
/// scheduling this processor.
pub trait AudioProcessor: Send {
    fn process(&mut self, quantum: &mut Quantum<'_>) -> bool;
}

impl<F> AudioProcessor for F
where
    F: FnMut(&mut Quantum<'_>) -> bool + Send,
{
    fn process(&mut self, quantum: &mut Quantum<'_>) -> bool {
        self(quantum)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutomationRate {
    /// Sample-accurate.
    #[default]
    ARate,
    /// One value per quantum.
    KRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub default_value: f32,
    pub min_value: f32,
    pub max_value: f32,
    pub automation_rate: AutomationRate,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, default_value: f32) -> Self {
        Self {
            name: name.into(),
            default_value,
            min_value: f32::MIN,
            max_value: f32::MAX,
            automation_rate: AutomationRate::ARate,
        }
    }

    pub fn range(mut self, min_value: f32, max_value: f32) -> Self {
        self.min_value = min_value;
        self.max_value = max_value;
        self
    }

    pub fn rate(mut self, automation_rate: AutomationRate) -> Self {
        self.automation_rate = automation_rate;
        self
    }
}

/// Construction options for a registered processor.
#[derive(Default)]
pub struct ProcessorOptions {
    data: Option<Box<dyn Any + Send>>,
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a typed value delivered to the factory whose data type matches.
    pub fn with_data<T: Any + Send>(mut self, data: T) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Take the data as `T`. A value of another type is `InvalidInput`.
    pub fn take_data<T: Any>(&mut self) -> io::Result<Option<T>> {
        let Some(data) = self.data.take() else {
            return Ok(None);
        };
        match data.downcast::<T>() {
            Ok(v) => Ok(Some(*v)),
            Err(other) => {
                self.data = Some(other);
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "processor options carry data of another type than {}",
                        std::any::type_name::<T>()
                    ),
                ))
            }
        }
    }
}

impl fmt::Debug for ProcessorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorOptions")
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// Type-erased constructor for one processor kind.
pub trait ProcessorFactory: Send + Sync {
    fn instantiate(&self, options: ProcessorOptions) -> io::Result<Box<dyn AudioProcessor>>;

    fn parameter_descriptors(&self) -> Vec<ParameterDescriptor> {
        Vec::new()
    }
}

/// A processor type with typed construction data, registered through
/// [`FactoryFor`].
pub trait ExtendProcessor: AudioProcessor + Sized + 'static {
    type Data: Any + Send;

    fn construct(data: Option<Self::Data>) -> io::Result<Self>;

    fn parameter_descriptors() -> Vec<ParameterDescriptor> {
        Vec::new()
    }
}

/// [`ProcessorFactory`] for an [`ExtendProcessor`] type.
pub struct FactoryFor<P>(PhantomData<fn() -> P>);

impl<P> FactoryFor<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for FactoryFor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ExtendProcessor> ProcessorFactory for FactoryFor<P> {
    fn instantiate(&self, mut options: ProcessorOptions) -> io::Result<Box<dyn AudioProcessor>> {
        let data = options.take_data::<P::Data>()?;
        Ok(Box::new(P::construct(data)?))
    }

    fn parameter_descriptors(&self) -> Vec<ParameterDescriptor> {
        P::parameter_descriptors()
    }
}

/// Processor factories by name.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    factories: HashMap<String, Arc<dyn ProcessorFactory>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. A name can only be registered once.
    pub fn register<F>(&mut self, name: &str, factory: F) -> io::Result<()>
    where
        F: ProcessorFactory + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("processor {name:?} already registered"),
            ));
        }
        self.factories.insert(name.to_owned(), Arc::new(factory));
        log::debug!("processor {name:?} registered");
        Ok(())
    }

    pub fn register_processor<P: ExtendProcessor>(&mut self, name: &str) -> io::Result<()> {
        self.register(name, FactoryFor::<P>::new())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn factory(&self, name: &str) -> io::Result<Arc<dyn ProcessorFactory>> {
        self.factories.get(name).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no processor registered as {name:?}"),
            )
        })
    }

    pub fn instantiate(
        &self,
        name: &str,
        options: ProcessorOptions,
    ) -> io::Result<Box<dyn AudioProcessor>> {
        self.factory(name)?.instantiate(options)
    }

    pub fn parameter_descriptors(&self, name: &str) -> io::Result<Vec<ParameterDescriptor>> {
        Ok(self.factory(name)?.parameter_descriptors())
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
