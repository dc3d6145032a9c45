//! Thin uniform wrapper over the TensorFlow Lite inference engine.

use tflitec::interpreter::{Interpreter, Options};
use tflitec::model::Model;
use tflitec::tensor::Shape;

use crate::error::{Result, VozError};

/// Inference seam between the pipeline stages and the engine.
///
/// All voz models take and produce f32 tensors; stages depend on this trait
/// so tests can drive them with stub models.
pub trait Infer {
    /// Runs one inference. `input` must match the current input-0 element
    /// count exactly; the output-0 contents are returned as an owned copy.
    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>>;

    fn input_shape(&self) -> &[usize];

    fn output_shape(&self) -> &[usize];

    fn set_input_shape(&mut self, shape: &[usize]) -> Result<()>;
}

/// TensorFlow Lite runner assuming exactly one input and one output tensor.
pub struct TfliteRunner {
    interpreter: Interpreter<'static>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

// The interpreter is owned by exactly one pipeline stage at a time and is
// never shared; moving it into that stage's thread is sound.
unsafe impl Send for TfliteRunner {}

impl TfliteRunner {
    /// Loads `path`, builds an interpreter with `threads` (and XNNPACK when
    /// `use_xnn` and the feature are available), optionally resizes input-0
    /// to `input_shape`, and allocates tensors.
    pub fn load(
        path: &str,
        threads: usize,
        use_xnn: bool,
        input_shape: Option<&[usize]>,
    ) -> Result<Self> {
        // Leak the model for a 'static interpreter; runners live for the
        // whole process.
        let model = Box::leak(Box::new(Model::new(path).map_err(|e| {
            VozError::NotRunnable(format!("failed to load model {}: {}", path, e))
        })?));

        let mut options = Options::default();
        options.thread_count = threads as i32;
        #[cfg(feature = "xnnpack")]
        {
            options.is_xnnpack_enabled = use_xnn;
        }
        #[cfg(not(feature = "xnnpack"))]
        let _ = use_xnn;

        let interpreter = Interpreter::new(model, Some(options)).map_err(|e| {
            VozError::TensorAlloc(format!("failed to create interpreter for {}: {}", path, e))
        })?;

        if let Some(shape) = input_shape {
            interpreter
                .resize_input(0, Shape::new(shape.to_vec()))
                .map_err(|e| {
                    VozError::TensorAlloc(format!("failed to resize input of {}: {}", path, e))
                })?;
        }

        interpreter.allocate_tensors().map_err(|e| {
            VozError::TensorAlloc(format!("failed to allocate tensors for {}: {}", path, e))
        })?;

        if interpreter.input_tensor_count() == 0 || interpreter.output_tensor_count() == 0 {
            return Err(VozError::NotRunnable(format!(
                "model {} has no input or output tensor",
                path
            )));
        }
        if interpreter.input_tensor_count() != 1 || interpreter.output_tensor_count() != 1 {
            return Err(VozError::NotRunnable(format!(
                "model {} must have exactly one input and one output tensor",
                path
            )));
        }

        let (input_shape, output_shape) = Self::cached_shapes(&interpreter)?;
        Ok(TfliteRunner { interpreter, input_shape, output_shape })
    }

    fn cached_shapes(interpreter: &Interpreter) -> Result<(Vec<usize>, Vec<usize>)> {
        let input = interpreter
            .input(0)
            .map_err(|e| VozError::TensorRuntime(format!("input tensor: {}", e)))?;
        let output = interpreter
            .output(0)
            .map_err(|e| VozError::TensorRuntime(format!("output tensor: {}", e)))?;
        Ok((
            input.shape().dimensions().clone(),
            output.shape().dimensions().clone(),
        ))
    }
}

impl Infer for TfliteRunner {
    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let expected: usize = self.input_shape.iter().product();
        if input.len() != expected {
            return Err(VozError::TensorRuntime(format!(
                "input length {} does not match tensor size {}",
                input.len(),
                expected
            )));
        }

        self.interpreter
            .copy(input, 0)
            .map_err(|e| VozError::TensorRuntime(format!("failed to set input: {}", e)))?;
        self.interpreter
            .invoke()
            .map_err(|e| VozError::TensorRuntime(format!("inference failed: {}", e)))?;

        let output = self
            .interpreter
            .output(0)
            .map_err(|e| VozError::TensorRuntime(format!("output tensor: {}", e)))?;
        Ok(output.data::<f32>().to_vec())
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Result<()> {
        self.interpreter
            .resize_input(0, Shape::new(shape.to_vec()))
            .map_err(|e| VozError::TensorRuntime(format!("failed to resize input: {}", e)))?;
        self.interpreter
            .allocate_tensors()
            .map_err(|e| VozError::TensorRuntime(format!("failed to reallocate tensors: {}", e)))?;
        let (input_shape, output_shape) = Self::cached_shapes(&self.interpreter)?;
        self.input_shape = input_shape;
        self.output_shape = output_shape;
        Ok(())
    }
}
