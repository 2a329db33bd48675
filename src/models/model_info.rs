/// Data struct about the available models
#[derive(Debug, Clone)]
pub struct ModelInfo<T> {
    pub model: T,
    pub dim: usize,
    pub description: String,
    /// Hugging Face repository holding the pretrained weights
    pub model_code: String,
    /// Weight file inside `model_code`
    pub model_file: String,
}
