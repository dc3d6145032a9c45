//! Stub inference models for driving the pipeline stages in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, VozError};
use crate::runner::Infer;

type OutputFn = Box<dyn FnMut(&[f32]) -> Vec<f32> + Send>;

/// An [`Infer`] implementation backed by a closure.
pub struct StubRunner {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    produce: OutputFn,
    calls: Arc<AtomicUsize>,
}

impl StubRunner {
    pub fn from_fn<F>(input_shape: &[usize], output_shape: &[usize], produce: F) -> Self
    where
        F: FnMut(&[f32]) -> Vec<f32> + Send + 'static,
    {
        StubRunner {
            input_shape: input_shape.to_vec(),
            output_shape: output_shape.to_vec(),
            produce: Box::new(produce),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always returns the output tensor filled with `value`.
    pub fn constant(input_shape: &[usize], output_shape: &[usize], value: f32) -> Self {
        let len: usize = output_shape.iter().product();
        Self::from_fn(input_shape, output_shape, move |_| vec![value; len])
    }

    /// Returns `scores[i]` on the i-th invocation, repeating the last score
    /// once the sequence is exhausted.
    pub fn scores(input_shape: &[usize], scores: Vec<f32>) -> Self {
        let mut at = 0usize;
        Self::from_fn(input_shape, &[1, 1], move |_| {
            let score = scores.get(at).or(scores.last()).copied().unwrap_or(0.0);
            at += 1;
            vec![score]
        })
    }

    /// Shared invocation counter.
    pub fn call_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Infer for StubRunner {
    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let expected: usize = self.input_shape.iter().product();
        if input.len() != expected {
            return Err(VozError::TensorRuntime(format!(
                "stub input length {} does not match tensor size {}",
                input.len(),
                expected
            )));
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok((self.produce)(input))
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Result<()> {
        self.input_shape = shape.to_vec();
        Ok(())
    }
}
