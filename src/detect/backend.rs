use anyhow::Result;

/// Inference runtime seam.
///
/// The runtime owns model loading, tensor buffers and job dispatch. The
/// pipeline only sequences the two jobs and then reads the quantized output
/// tensor, laid out as `boxes x (5 + classes)` bytes.
///
/// Job failures are reported as `Err`; the pipeline counts them against its
/// error budget. Timeouts are the runtime's responsibility.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Convert the captured frame into the model input tensor.
    fn run_preprocessing(&mut self) -> Result<()>;

    /// Run the model on the prepared input.
    fn run_inference(&mut self) -> Result<()>;

    /// Output tensor of the last successful inference.
    fn output_tensor(&self) -> &[u8];
}
