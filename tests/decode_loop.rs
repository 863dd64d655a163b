//! Decode loop against a scripted backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use onllm::{DecodeLoop, DecodeOutcome, EarlyStop, GenerationConfig, StopReason};
use onllm_tokenizer::Tokenizer;
use tokio_util::sync::CancellationToken;

fn greedy(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        early_stop: None,
        ..GenerationConfig::greedy()
    }
}

fn prompt(model: &onllm::LoadedModel) -> Vec<u32> {
    model.tokenizer.encode("<|im_start|>user\nHi<|im_end|>\n", false).unwrap()
}

#[test]
fn stops_at_max_new_tokens_without_eos() {
    let backend = Arc::new(ScriptedBackend::endless('a'));
    let model = chatml_model(backend.clone(), true);
    let prompt = prompt(&model);
    let mut cache = model.spec.new_cache().unwrap();

    let config = greedy(5);
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt, &mut cache, &CancellationToken::new(), |_| {})
        .unwrap();

    let DecodeOutcome::Completed(generation) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(generation.text, "aaaaa");
    assert_eq!(generation.stop_reason, StopReason::MaxTokens);
    assert_eq!(generation.stats.generated_tokens, 5);
    assert_eq!(generation.stats.prompt_tokens, prompt.len());
    assert_eq!(backend.steps().len(), 5);
    assert_eq!(cache.seq_len(), prompt.len() + 4);
}

#[test]
fn eos_first_gives_empty_text() {
    let backend = Arc::new(ScriptedBackend::reply(""));
    let model = chatml_model(backend.clone(), true);
    let mut cache = model.spec.new_cache().unwrap();
    let mut partials = Vec::new();

    let config = greedy(64);
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &CancellationToken::new(), |f| {
            partials.push(f.to_string())
        })
        .unwrap();

    let DecodeOutcome::Completed(generation) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(generation.text, "");
    assert_eq!(generation.stop_reason, StopReason::EndOfSequence);
    assert!(partials.is_empty());
    assert_eq!(backend.steps().len(), 1);
}

#[test]
fn precancelled_runs_no_steps() {
    let backend = Arc::new(ScriptedBackend::endless('a'));
    let model = chatml_model(backend.clone(), true);
    let mut cache = model.spec.new_cache().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let config = greedy(64);
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &cancel, |_| panic!("no partials"))
        .unwrap();

    assert_eq!(outcome, DecodeOutcome::Cancelled);
    assert!(backend.steps().is_empty());
}

#[test]
fn cancel_from_partial_stops_before_next_step() {
    let backend = Arc::new(ScriptedBackend::endless('a'));
    let model = chatml_model(backend.clone(), true);
    let prompt = prompt(&model);
    let mut cache = model.spec.new_cache().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut partials = Vec::new();

    let config = greedy(64);
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt, &mut cache, &cancel, |f| {
            partials.push(f.to_string());
            if partials.len() == 2 {
                trigger.cancel();
            }
        })
        .unwrap();

    assert_eq!(outcome, DecodeOutcome::Cancelled);
    assert_eq!(partials, vec!["a", "a"]);
    assert_eq!(backend.steps().len(), 2);
    assert_eq!(cache.seq_len(), prompt.len() + 1);
}

#[test]
fn cancel_during_step_discards_its_token() {
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let backend = Arc::new(ScriptedBackend::endless('a').gated(gate_rx));
    let model = chatml_model(backend.clone(), true);
    let prompt = prompt(&model);
    let cancel = CancellationToken::new();
    let (partial_tx, partial_rx) = crossbeam_channel::unbounded();
    gate_tx.send(()).unwrap();

    let outcome = std::thread::scope(|scope| {
        let worker = scope.spawn(|| {
            let mut cache = model.spec.new_cache().unwrap();
            let config = greedy(64);
            DecodeLoop::new(&model, &config)
                .run(&prompt, &mut cache, &cancel, |f| {
                    partial_tx.send(f.to_string()).unwrap();
                })
                .unwrap()
        });

        assert_eq!(
            partial_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            "a"
        );
        // The second step is blocked inside the backend.
        while backend.steps().len() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        cancel.cancel();
        drop(gate_tx);
        worker.join().unwrap()
    });

    assert_eq!(outcome, DecodeOutcome::Cancelled);
    assert!(partial_rx.try_recv().is_err());
    assert_eq!(backend.steps().len(), 2);
}

#[test]
fn step_inputs_follow_graph_contract() {
    let backend = Arc::new(ScriptedBackend::reply("ok"));
    let model = chatml_model(backend.clone(), true);
    let prompt = prompt(&model);
    let n = prompt.len();
    let mut cache = model.spec.new_cache().unwrap();

    let config = greedy(64);
    DecodeLoop::new(&model, &config)
        .run(&prompt, &mut cache, &CancellationToken::new(), |_| {})
        .unwrap();

    let steps = backend.steps();
    assert_eq!(steps.len(), 3);

    let first = &steps[0];
    assert_eq!(first.input_ids.len(), n);
    assert_eq!(first.position_ids, (0..n as i64).collect::<Vec<_>>());
    assert_eq!(first.attention_mask, Some(vec![1; n]));
    assert_eq!(first.past_len, 0);

    let second = &steps[1];
    assert_eq!(second.input_ids, vec![i64::from(model.tokenizer.token_to_id("o").unwrap())]);
    assert_eq!(second.position_ids, vec![n as i64]);
    assert_eq!(second.attention_mask, Some(vec![1; n + 1]));
    assert_eq!(second.past_len, n);

    assert_eq!(steps[2].position_ids, vec![n as i64 + 1]);
    assert_eq!(steps[2].past_len, n + 1);
}

#[test]
fn no_mask_when_model_does_not_need_one() {
    let backend = Arc::new(ScriptedBackend::reply("x"));
    let model = chatml_model(backend.clone(), false);
    let mut cache = model.spec.new_cache().unwrap();

    let config = greedy(64);
    DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &CancellationToken::new(), |_| {})
        .unwrap();

    assert!(backend.steps().iter().all(|s| s.attention_mask.is_none()));
}

#[test]
fn partials_concatenate_to_final_text() {
    let backend = Arc::new(ScriptedBackend::reply("Hello there"));
    let model = chatml_model(backend, true);
    let mut cache = model.spec.new_cache().unwrap();
    let mut streamed = String::new();

    let config = greedy(64);
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &CancellationToken::new(), |f| {
            streamed.push_str(f)
        })
        .unwrap();

    let DecodeOutcome::Completed(generation) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(generation.text, "Hello there");
    assert_eq!(streamed, generation.text);
}

#[test]
fn early_stop_on_trailing_ellipsis() {
    let backend = Arc::new(ScriptedBackend::reply("this is long enough.. and then some"));
    let model = chatml_model(backend, true);
    let mut cache = model.spec.new_cache().unwrap();

    let config = GenerationConfig {
        early_stop: Some(EarlyStop::default()),
        ..greedy(256)
    };
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &CancellationToken::new(), |_| {})
        .unwrap();

    let DecodeOutcome::Completed(generation) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(generation.text, "this is long enough..");
    assert_eq!(generation.stop_reason, StopReason::EarlyStop);
}

#[test]
fn short_ellipsis_does_not_stop() {
    let backend = Arc::new(ScriptedBackend::reply("wait.. ok"));
    let model = chatml_model(backend, true);
    let mut cache = model.spec.new_cache().unwrap();

    let config = GenerationConfig {
        early_stop: Some(EarlyStop::default()),
        ..greedy(256)
    };
    let outcome = DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &CancellationToken::new(), |_| {})
        .unwrap();

    let DecodeOutcome::Completed(generation) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(generation.text, "wait.. ok");
    assert_eq!(generation.stop_reason, StopReason::EndOfSequence);
}

#[test]
fn engine_error_aborts() {
    let backend = Arc::new(ScriptedBackend::endless('a').failing_at(2));
    let model = chatml_model(backend.clone(), true);
    let mut cache = model.spec.new_cache().unwrap();

    let config = greedy(64);
    let err = DecodeLoop::new(&model, &config)
        .run(&prompt(&model), &mut cache, &CancellationToken::new(), |_| {})
        .unwrap_err();

    assert!(err.to_string().contains("scripted failure at step 2"));
    assert_eq!(backend.steps().len(), 3);
}

#[test]
fn empty_prompt_is_rejected() {
    let backend = Arc::new(ScriptedBackend::endless('a'));
    let model = chatml_model(backend.clone(), true);
    let mut cache = model.spec.new_cache().unwrap();

    let config = greedy(64);
    assert!(DecodeLoop::new(&model, &config)
        .run(&[], &mut cache, &CancellationToken::new(), |_| {})
        .is_err());
    assert!(backend.steps().is_empty());
}
