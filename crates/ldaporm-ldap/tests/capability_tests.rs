//! Capability detection through live sessions and managers.

mod common;

use std::sync::Arc;

use common::*;
use ldaporm_ldap::prelude::*;

fn session(directory: &MemoryDirectory) -> Box<dyn DirectorySession> {
    let servers = servers();
    let config = servers.role("default", Role::Read).unwrap();
    directory.connector().open(config).unwrap()
}

#[test]
fn test_flavors_from_fixture_servers() {
    let caps = ServerCapabilities::default();
    let cases = [
        (openldap_root_dse(true), ServerFlavor::OpenLdap, 500),
        (ds389_root_dse(), ServerFlavor::Ds389, 2000),
        (active_directory_root_dse(), ServerFlavor::ActiveDirectory, 1000),
        (root_dse(&[("vendorName", "Acme Directory")]), ServerFlavor::Unknown, 1000),
    ];

    for (index, (root, flavor, page_size)) in cases.into_iter().enumerate() {
        let directory = MemoryDirectory::new(root);
        let mut session = session(&directory);
        let key = format!("server-{index}");

        let record = caps.get_capabilities(session.as_mut(), &key).unwrap();
        assert_eq!(record.flavor, flavor);
        assert_eq!(record.page_size, page_size);
        assert_eq!(caps.detect_flavor(session.as_mut(), &key).unwrap(), flavor);
        if flavor == ServerFlavor::Unknown {
            assert_eq!(record.vendor_name.as_deref(), Some("Acme Directory"));
            assert!(!record.sorting);
        }
    }
    assert_eq!(caps.stats().total_entries, 4);
}

#[test]
fn test_manager_probes_root_dse_once() {
    let directory = users_directory();
    let users = manager(&directory);

    users.order_by(["uid"]).unwrap().all().unwrap();
    users.order_by(["uid"]).unwrap().slice(Some(1), Some(3)).unwrap();
    users.order_by(["-uid"]).unwrap().all().unwrap();
    assert_eq!(directory.root_dse_probes(), 1);

    let stats = users.capabilities().stats();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.valid_entries, 1);
    assert_eq!(stats.cache_keys, vec!["default/read".to_string()]);
}

#[test]
fn test_shared_cache_across_managers() {
    let directory = users_directory();
    let caps = Arc::new(ServerCapabilities::default());
    let first = LdapManager::new(user_meta(), servers(), directory.connector(), Arc::clone(&caps)).unwrap();
    let second = LdapManager::new(user_meta(), servers(), directory.connector(), Arc::clone(&caps)).unwrap();

    first.order_by(["uid"]).unwrap().all().unwrap();
    second.order_by(["uid"]).unwrap().all().unwrap();
    assert_eq!(directory.root_dse_probes(), 1);

    caps.clear(Some("default/read"));
    second.order_by(["uid"]).unwrap().all().unwrap();
    assert_eq!(directory.root_dse_probes(), 2);
}

#[test]
fn test_failed_probe_degrades_without_caching() {
    let directory = users_directory();
    directory.fail_root_dse(ResultCode::UNWILLING_TO_PERFORM);
    let users = manager(&directory);

    let entries = users.order_by(["-uid"]).unwrap().all().unwrap();
    assert_eq!(uids(&entries)[0], "edward");
    assert!(directory
        .data_requests()
        .iter()
        .all(|r| r.controls.is_empty()));
    assert_eq!(users.capabilities().stats().total_entries, 0);

    users.order_by(["uid"]).unwrap().all().unwrap();
    assert_eq!(directory.root_dse_probes(), 2);
}

#[test]
fn test_clear_all_entries() {
    let caps = ServerCapabilities::default();
    let directory = users_directory();
    let mut session = session(&directory);

    caps.get_capabilities(session.as_mut(), "a").unwrap();
    caps.get_capabilities(session.as_mut(), "b").unwrap();
    assert_eq!(caps.stats().total_entries, 2);

    caps.clear(None);
    let stats = caps.stats();
    assert_eq!(stats.total_entries, 0);
    assert!(stats.cache_keys.is_empty());
}
