pub mod chat;
pub mod context;
pub mod error;
pub mod explain;
pub mod inference;
pub mod model;
pub mod runtime;
pub mod sampling;
pub mod settings;
pub mod template;
pub mod tokenizer;

pub use context::{ModelContext, ModelSlot, ModelStatus, SlotState};
pub use error::{CoreError, Result};
pub use explain::{AttributionResult, TextExplanation};
pub use inference::{PredictInput, Prediction, run_prediction};
pub use model::{
    AudioChatFactory, HubModelLoader, LoadRequest, LoadedModel, ModelInfo, ModelLoader, ModelMode,
};
pub use runtime::{DeviceKind, Precision};
pub use settings::{ExplainSettings, GenerationSettings};
