use crate::decoder::TransformerModel;
use crate::tensor::Tensor;
use crate::tests::common::{assert_all_close, deterministic_weights, gpu_context, tiny_config};
use crate::traits::{Device, Model};

#[tokio::test]
async fn test_model_logits_match_cpu() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let mut config = tiny_config();
    config.qk_norm = true;
    let weights = deterministic_weights(&config, 31);

    let mut cpu_model = TransformerModel::new(config.clone(), weights.clone());
    cpu_model.init(Device::Cpu, None).unwrap();
    let mut gpu_model = TransformerModel::new(config.clone(), weights);
    gpu_model.init(Device::Wgpu, Some(context)).unwrap();

    let prompt = [3u32, 1, 4, 1, 5];
    for model in [&cpu_model, &gpu_model] {
        let embeds = model.embedding(&prompt).unwrap();
        model.forward(&embeds.embeddings, &Tensor::scalar_u32(0)).unwrap();
    }
    assert_all_close(
        &gpu_model.logits().unwrap(),
        &cpu_model.logits().unwrap(),
        1e-3,
        "prefill logits",
    );

    // one decode step on top of the prefilled cache
    for model in [&cpu_model, &gpu_model] {
        let embeds = model.embedding(&[9]).unwrap();
        model.forward(&embeds.embeddings, &Tensor::scalar_u32(5)).unwrap();
    }
    assert_all_close(
        &gpu_model.logits().unwrap(),
        &cpu_model.logits().unwrap(),
        1e-3,
        "decode logits",
    );
    assert_eq!(gpu_model.kv_cache().unwrap().populated_slots(1).unwrap(), 6);
}
