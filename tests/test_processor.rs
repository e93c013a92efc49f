// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Processor registry: registration by name, typed construction data and
// parameter metadata.

use std::io;

use libhandoff::{
    AudioProcessor, AutomationRate, ExtendProcessor, ParameterDescriptor, ProcessorOptions,
    ProcessorRegistry, Quantum,
};

struct Gain {
    level: f32,
}

impl AudioProcessor for Gain {
    fn process(&mut self, quantum: &mut Quantum<'_>) -> bool {
        let level = quantum.params.first().copied().unwrap_or(self.level);
        for (out, sample) in quantum.outputs.iter_mut().zip(quantum.inputs) {
            *out = sample * level;
        }
        true
    }
}

impl ExtendProcessor for Gain {
    type Data = f32;

    fn construct(data: Option<f32>) -> io::Result<Self> {
        Ok(Self {
            level: data.unwrap_or(1.0),
        })
    }

    fn parameter_descriptors() -> Vec<ParameterDescriptor> {
        vec![ParameterDescriptor::new("gain", 1.0)
            .range(0.0, 4.0)
            .rate(AutomationRate::KRate)]
    }
}

fn render(processor: &mut dyn AudioProcessor, params: &[f32]) -> (bool, [f32; 4]) {
    let inputs = [1.0f32, 2.0, 3.0, 4.0];
    let mut outputs = [0.0f32; 4];
    let keep = processor.process(&mut Quantum {
        index: 0,
        sample_rate: 48_000,
        inputs: &inputs,
        outputs: &mut outputs,
        params,
    });
    (keep, outputs)
}

#[test]
fn register_and_instantiate() {
    let mut registry = ProcessorRegistry::new();
    registry.register_processor::<Gain>("gain").expect("register");
    assert!(registry.contains("gain"));
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["gain"]);

    let mut p = registry
        .instantiate("gain", ProcessorOptions::new().with_data(0.5f32))
        .expect("instantiate");
    let (keep, out) = render(p.as_mut(), &[]);
    assert!(keep);
    assert_eq!(out, [0.5, 1.0, 1.5, 2.0]);

    // Parameter values override the construction level.
    let (_, out) = render(p.as_mut(), &[2.0]);
    assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
}

// A name can only be registered once.
#[test]
fn duplicate_name_is_rejected() {
    let mut registry = ProcessorRegistry::new();
    registry.register_processor::<Gain>("gain").expect("first");
    let err = registry.register_processor::<Gain>("gain").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
}

#[test]
fn unknown_name_is_not_found() {
    let registry = ProcessorRegistry::new();
    let err = registry
        .instantiate("missing", ProcessorOptions::new())
        .err()
        .expect("no factory");
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
    assert_eq!(
        registry.parameter_descriptors("missing").unwrap_err().kind(),
        io::ErrorKind::NotFound
    );
}

// Construction data of the wrong type is refused, not silently dropped.
#[test]
fn mismatched_data_is_invalid_input() {
    let mut registry = ProcessorRegistry::new();
    registry.register_processor::<Gain>("gain").expect("register");
    let err = registry
        .instantiate("gain", ProcessorOptions::new().with_data("loud"))
        .err()
        .expect("type mismatch");
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let mut options = ProcessorOptions::new().with_data(3u8);
    assert!(options.take_data::<u16>().is_err());
    assert!(options.has_data());
    assert_eq!(options.take_data::<u8>().unwrap(), Some(3));
    assert!(!options.has_data());
}

#[test]
fn descriptors_come_from_the_processor_type() {
    let mut registry = ProcessorRegistry::new();
    registry.register_processor::<Gain>("gain").expect("register");
    let descriptors = registry.parameter_descriptors("gain").expect("descriptors");
    assert_eq!(descriptors.len(), 1);
    let d = &descriptors[0];
    assert_eq!(d.name, "gain");
    assert_eq!((d.min_value, d.max_value), (0.0, 4.0));
    assert_eq!(d.automation_rate, AutomationRate::KRate);
}

// Closures are processors too; returning false ends scheduling.
#[test]
fn closure_processor() {
    let mut ticks = 0;
    let mut p = move |_: &mut Quantum<'_>| {
        ticks += 1;
        ticks < 2
    };
    assert!(render(&mut p, &[]).0);
    assert!(!render(&mut p, &[]).0);
}
