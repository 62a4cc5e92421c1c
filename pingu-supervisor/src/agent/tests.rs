use super::*;
use uuid::Uuid;

fn environment(root: &std::path::Path) -> Environment {
    Environment {
        instance_id: Uuid::nil(),
        machine_id: Uuid::nil(),
        bot_name: "bot-1".into(),
        root_dir: root.to_path_buf(),
        extra: Default::default(),
    }
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        api_url: "https://api.example.test".parse().unwrap(),
        api_key: None,
        instance_id: Uuid::nil(),
        machine_id: Uuid::nil(),
        bot_name: "bot-1".into(),
        worker_binary: "pingu-worker".into(),
        run_timeout_seconds: 3600,
    }
}

#[test]
fn test_agent_construction() {
    let dir = tempfile::tempdir().unwrap();
    let api = Client::new("https://api.example.test".parse().unwrap(), None).unwrap();
    let _agent = Agent::new(api, environment(dir.path()), config());
}
