use std::sync::Arc;
use tempfile::tempdir;
use voice_engine_server::backends::Voice;
use voice_engine_server::voice_registry::{SledStore, VoiceRegistrar, RegistrationLayout};

fn layout() -> RegistrationLayout {
    RegistrationLayout {
        token_prefix: "PYTTS".into(),
        adapter_class: "VoiceEngineAdapter".into(),
        adapter_module: "pysapittsengine.dll".into(),
        voice_module: "voices".into(),
        runtime_path: "/opt/voice-engine".into(),
    }
}

#[test]
fn test_registration_flooding() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SledStore::open(&dir.path().join("registry")).unwrap());
    let registrar = Arc::new(VoiceRegistrar::new(store, layout()));

    println!("Starting registration flooding test (8 threads x 50 voices)...");

    let start = std::time::Instant::now();
    let workers: Vec<_> = (0..8)
        .map(|t| {
            let registrar = registrar.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let voice = Voice {
                        id: format!("voice-{}-{}", t, i),
                        name: format!("Voice {} {}", t, i),
                        locale: Some("en-US".into()),
                        gender: None,
                    };
                    // Every thread writes the same shared voice too
                    let shared = Voice {
                        id: "shared".into(),
                        name: format!("Shared by {}", t),
                        locale: None,
                        gender: None,
                    };
                    registrar
                        .register_voice("Flood", None, &voice)
                        .expect("Failed to register during flood");
                    registrar
                        .register_voice("Flood", None, &shared)
                        .expect("Failed to register shared voice");
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    let duration = start.elapsed();
    println!("Flood complete in {:?}", duration);

    for t in 0..8 {
        for i in 0..50 {
            let record = registrar
                .lookup("Flood", &format!("voice-{}-{}", t, i))
                .unwrap()
                .expect("record missing after flood");
            assert_eq!(record.name, format!("Voice {} {}", t, i));
        }
    }

    // The shared record is whole, not a mix of two writers
    let shared = registrar.lookup("Flood", "shared").unwrap().unwrap();
    assert!(shared.name.starts_with("Shared by "));
    assert_eq!(shared.language, "und");
    assert!(registrar.adapter_registered().unwrap());
}
