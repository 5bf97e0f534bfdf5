//! End-to-end key flow: password → master key → listing → node keys →
//! attributes, as a client session performs it after login.

use std::sync::{Arc, Barrier};
use std::thread;

use secrecy::SecretString;
use serde_json::json;

use nimbus_core::{CryptoConfig, CryptoError, Node, NodeTree};
use nimbus_crypto::{
    attrs, decrypt_master_key, derive_credentials, encrypt_master_key, random_key,
    wrap_node_key, AccountParams, Attributes, FileKey, MasterKey, NodeKey, NodeKeyManager,
};

fn fast_config() -> CryptoConfig {
    CryptoConfig {
        pbkdf2_iterations: 500,
        legacy_rounds: 8,
        legacy_hash_rounds: 4,
    }
}

struct Account {
    wrapped_master: String,
    master: MasterKey,
    listing: serde_json::Value,
    file_key: FileKey,
}

/// Server-side state of a small account: root, a folder, a file inside it,
/// and the trash.
fn account(password_key: &nimbus_crypto::AesKey) -> Account {
    let master = MasterKey::new(random_key());
    let wrapped_master = encrypt_master_key(password_key, &master).unwrap();

    let folder = nimbus_crypto::generate_folder_key();
    let folder_key = folder.wrapping_key().unwrap();
    let file_key = FileKey::from_bytes(std::array::from_fn(|i| (i as u8).wrapping_mul(31)));
    let file = NodeKey::File(file_key.clone());

    let folder_k = wrap_node_key(&folder, master.as_key()).unwrap().to_b64();
    let file_k = wrap_node_key(&file, &folder_key).unwrap().to_b64();
    let folder_a = attrs::encrypt_b64(&folder.attribute_key(), &Attributes::new("Projects")).unwrap();
    let file_a = attrs::encrypt_b64(&file.attribute_key(), &Attributes::new("plan.md")).unwrap();

    // Children listed before their parents, as the service does
    let listing = json!([
        {"h": "file0001", "p": "fold0001", "u": "user0001", "t": 0,
         "k": format!("fold0001:{file_k}"), "a": file_a, "s": 1234, "ts": 1700000100},
        {"h": "fold0001", "p": "root0001", "u": "user0001", "t": 1,
         "k": format!("user0001:{folder_k}"), "a": folder_a, "ts": 1700000000},
        {"h": "root0001", "p": "", "u": "user0001", "t": 2},
        {"h": "trash001", "p": "", "u": "user0001", "t": 4},
    ]);

    Account {
        wrapped_master,
        master,
        listing,
        file_key,
    }
}

fn login(email: &str, password: &str, params: &AccountParams) -> nimbus_crypto::AesKey {
    derive_credentials(params, &fast_config(), email, &SecretString::from(password))
        .unwrap()
        .password_key
}

#[test]
fn salted_account_session() {
    let params = AccountParams::salted(vec![0x3C; 32]);
    let password_key = login("alice@example.com", "hunter2 but longer", &params);
    let account = account(&password_key);

    // Client side
    let master = decrypt_master_key(&password_key, &account.wrapped_master).unwrap();
    assert_eq!(master, account.master);

    let nodes: Vec<Node> = serde_json::from_value(account.listing).unwrap();
    let tree = NodeTree::build_strict(nodes).unwrap();
    assert!(tree.report().is_clean());

    let manager = NodeKeyManager::new("user0001".into(), master);
    let name = manager.attributes(&tree, &"file0001".into()).unwrap().name;
    assert_eq!(name, "plan.md");
    assert_eq!(
        manager.file_key(&tree, &"file0001".into()).unwrap(),
        account.file_key
    );
}

#[test]
fn wrong_password_yields_no_names() {
    let params = AccountParams::legacy();
    let password_key = login("bob@example.com", "right password", &params);
    let account = account(&password_key);

    let wrong_key = login("bob@example.com", "wrong password", &params);
    let master = decrypt_master_key(&wrong_key, &account.wrapped_master).unwrap();

    let nodes: Vec<Node> = serde_json::from_value(account.listing).unwrap();
    let tree = NodeTree::build(nodes);
    let manager = NodeKeyManager::new("user0001".into(), master);

    // Garbage keys must surface as corrupt attributes, never as a made-up name
    let result = manager.attributes(&tree, &"fold0001".into());
    assert!(matches!(result, Err(CryptoError::CorruptAttributes(_))));
}

#[test]
fn concurrent_first_access_shares_one_key() {
    let params = AccountParams::legacy();
    let password_key = login("carol@example.com", "pw", &params);
    let account = account(&password_key);
    let master = decrypt_master_key(&password_key, &account.wrapped_master).unwrap();

    let nodes: Vec<Node> = serde_json::from_value(account.listing).unwrap();
    let tree = Arc::new(NodeTree::build(nodes));
    let manager = Arc::new(NodeKeyManager::new("user0001".into(), master));
    let barrier = Arc::new(Barrier::new(50));

    let workers: Vec<_> = (0..50)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.node_key(&tree, &"file0001".into()).unwrap()
            })
        })
        .collect();

    let keys: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    // One derivation means one allocation handed to everyone
    assert!(keys.iter().all(|k| Arc::ptr_eq(k, &keys[0])));
    assert_eq!(keys[0].as_file(), Some(&account.file_key));
}
