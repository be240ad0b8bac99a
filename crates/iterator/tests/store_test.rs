use iterator::store::{ConsulStore, FsStore, PersistedBinding, StateStore};

#[test]
fn binding_round_trips_through_json() {
    let binding = PersistedBinding {
        fingerprint: "abc123".to_string(),
        module: "/modules/web".to_string(),
        terraform_scheduling: "sawtooth".to_string(),
    };
    let bytes = binding.to_bytes().unwrap();
    let decoded = PersistedBinding::from_bytes(&bytes).unwrap();
    assert_eq!(binding, decoded);
}

#[test]
fn binding_tolerates_missing_scheduling() {
    // Records written before scheduling modes existed carry no
    // terraform_scheduling key.
    let decoded =
        PersistedBinding::from_bytes(br#"{"fingerprint":"abc","module":"/m"}"#).unwrap();
    assert_eq!(decoded.terraform_scheduling, "");
    assert!(!decoded.is_sawtooth());
}

#[tokio::test]
async fn fs_store_get_put_delete_list() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    store.init().await.unwrap();

    assert_eq!(store.get("a").await.unwrap(), None);

    store.put("a", b"{\"fingerprint\":\"a\"}").await.unwrap();
    store.put("b", b"{\"fingerprint\":\"b\"}").await.unwrap();
    assert_eq!(
        store.get("a").await.unwrap(),
        Some(b"{\"fingerprint\":\"a\"}".to_vec())
    );
    assert_eq!(store.list(false).await.unwrap(), vec!["a", "b"]);

    store.delete("a").await.unwrap();
    assert_eq!(store.get("a").await.unwrap(), None);
    // Deleting an absent key is a no-op.
    store.delete("a").await.unwrap();
    assert_eq!(store.list(false).await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn fs_store_lists_nothing_before_init() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path().join("missing"));
    assert!(store.list(false).await.unwrap().is_empty());
}

// The two backends inherited divergent binding keys: the filesystem keys by
// fingerprint while the remote KV keys by alert name. A binding written by
// the firing path on the filesystem backend is therefore only reachable by
// name when fingerprint and alert name coincide.
#[test]
fn backends_disagree_on_binding_keys() {
    let dir = tempfile::tempdir().unwrap();
    let fs = FsStore::new(dir.path());
    let consul = ConsulStore::new("127.0.0.1:8500");

    assert_eq!(fs.binding_key("fp1", "HighLoad"), "fp1");
    assert_eq!(consul.binding_key("fp1", "HighLoad"), "HighLoad");
}
