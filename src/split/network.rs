use ndarray::{Array2, ArrayView2, ArrayView4};

use super::{ClientStage, ServerStage};
use crate::{SplitErr, arch::Phase, error::Result};

/// The output of a whole-network pass.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub output: Array2<f32>,
}

/// A client and a server stage chained together, for running the network without splitting it.
pub struct SplitNetwork {
    client: ClientStage,
    server: ServerStage,
}

impl SplitNetwork {
    /// Creates a new `SplitNetwork`.
    ///
    /// # Returns
    /// The network, or `ShapeMismatch` if the client's activation is not what the server
    /// accepts.
    pub fn new(client: ClientStage, server: ServerStage) -> Result<Self> {
        let (out_channels, (oh, ow)) = client.output_shape();
        let (in_channels, (ih, iw)) = server.input_shape();

        if (out_channels, oh, ow) != (in_channels, ih, iw) {
            return Err(SplitErr::ShapeMismatch {
                what: "cut activation",
                got: vec![out_channels, oh, ow],
                expected: vec![in_channels, ih, iw],
            });
        }

        Ok(Self { client, server })
    }

    pub fn client(&self) -> &ClientStage {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ClientStage {
        &mut self.client
    }

    pub fn server(&self) -> &ServerStage {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut ServerStage {
        &mut self.server
    }

    pub fn into_parts(self) -> (ClientStage, ServerStage) {
        (self.client, self.server)
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.client.set_phase(phase);
        self.server.set_phase(phase);
    }

    pub fn zero_grad(&mut self) {
        self.client.zero_grad();
        self.server.zero_grad();
    }

    /// Runs the client in its encoding pass and the server on its activation, recording both.
    pub fn forward(&mut self, input: ArrayView4<f32>) -> Result<NetworkOutput> {
        let activation = self.client.encode(input)?;
        let output = self.server.forward(activation.view())?;
        Ok(NetworkOutput { output })
    }

    /// Runs both halves without recording anything.
    pub fn infer(&self, input: ArrayView4<f32>) -> Result<NetworkOutput> {
        let activation = self.client.infer(input)?;
        let output = self.server.infer(activation.view())?;
        Ok(NetworkOutput { output })
    }

    /// Backpropagates the gradient of the logits through the server and across the cut.
    pub fn backward(&mut self, d_logits: ArrayView2<f32>) -> Result<()> {
        let d_activation = self.server.backward(d_logits)?;
        self.client.backward(d_activation.view())
    }
}
