//! The built-in layout-introduction command.
//!
//! Published by the facade on start (and incrementally when type sets
//! grow while running) so every installed layout is introduced in the
//! journal before any entity of that type can appear.

use std::sync::{Arc, OnceLock};

use crate::core::{
    Command, Entity, EntityLayoutIntroduced, Event, EventStream, HostError, Layout, LayoutBuilder,
    PropertyType, TypeName, Value,
};

/// Introduces the given layouts as `EntityLayoutIntroduced` events.
#[derive(Clone, Debug)]
pub struct IntroduceEntityLayouts {
    layouts: Vec<Arc<Layout>>,
}

impl IntroduceEntityLayouts {
    pub fn new(layouts: Vec<Arc<Layout>>) -> Self {
        Self { layouts }
    }

    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                LayoutBuilder::new(
                    TypeName::new("IntroduceEntityLayouts").expect("builtin type name"),
                )
                .property("fingerprints", PropertyType::list(PropertyType::Bytes))
                .finish()
                .expect("builtin layout")
            })
            .clone()
    }
}

impl Entity for IntroduceEntityLayouts {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::List(
            self.layouts
                .iter()
                .map(|l| Value::Bytes(l.fingerprint().as_bytes().to_vec()))
                .collect(),
        )]
    }
}

impl Command for IntroduceEntityLayouts {
    /// Number of introductions emitted.
    type State = usize;
    type Output = usize;

    fn execute(&self) -> Result<EventStream<Self::State>, HostError> {
        let mut pending = self.layouts.clone().into_iter();
        Ok(EventStream::new(0usize, move |count| {
            pending.next().map(|layout| {
                *count += 1;
                Ok(Box::new(EntityLayoutIntroduced::new(&layout)) as Box<dyn Event>)
            })
        }))
    }

    fn result(&self, state: Self::State) -> Self::Output {
        state
    }
}
