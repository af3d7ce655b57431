use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;

use fleetsshd::os::users::{LocalUser, StaticUsers};
use fleetsshd::os::utmp::NoLoginAccounting;
use fleetsshd::session::command::{exit_code, resolve_shell, CommandSpec, DEFAULT_PATH, DEVICE_ENV};
use fleetsshd::session::registry::ProcessRegistry;
use fleetsshd::session::{HandlerContext, WindowSize};
use proptest::prelude::*;

fn ctx(shell_override: Option<String>) -> HandlerContext {
    HandlerContext::new(
        Arc::new(StaticUsers::new()),
        Arc::new(ProcessRegistry::new()),
        Arc::new(NoLoginAccounting),
        "edge-gw-01",
    )
    .with_shell_override(shell_override)
}

fn operator() -> LocalUser {
    LocalUser::new("operator", 1001, 1001, "/nonexistent/operator", "/bin/ash")
}

fn arg() -> impl Strategy<Value = String> {
    "[^\\x00]{0,24}"
}

proptest! {
    #[test]
    fn exec_keeps_argv_verbatim(argv in prop::collection::vec(arg(), 1..8)) {
        let spec = CommandSpec::exec(&operator(), &ctx(None), &argv);
        prop_assert_eq!(spec.argv(), argv);
        prop_assert!(!spec.controlling_tty);
        prop_assert_eq!(spec.env_var("TERM"), None);
        prop_assert_eq!(spec.env_var("PATH"), Some(DEFAULT_PATH));
        prop_assert_eq!(spec.env_var(DEVICE_ENV), Some("edge-gw-01"));
        prop_assert_eq!(spec.cwd.to_str(), Some("/"));
    }

    #[test]
    fn login_shell_always_has_a_term(term in "[a-z0-9-]{0,16}") {
        let spec = CommandSpec::login_shell(&operator(), &ctx(None), &term);
        let expected = if term.is_empty() { "xterm" } else { term.as_str() };
        prop_assert_eq!(spec.env_var("TERM"), Some(expected));
        prop_assert_eq!(spec.argv(), vec!["/bin/ash".to_string(), "--login".to_string()]);
        prop_assert!(spec.controlling_tty);
    }

    #[test]
    fn shell_override_wins_when_set(shell in "/[a-z/]{1,20}") {
        prop_assert_eq!(resolve_shell(&operator(), Some(shell.as_str())), shell.clone());
        let spec = CommandSpec::exec(&operator(), &ctx(Some(shell.clone())), &[]);
        prop_assert_eq!(spec.program, shell);
        prop_assert_eq!(spec.args, vec!["--login".to_string()]);
    }

    #[test]
    fn window_size_saturates(cols in any::<u32>(), rows in any::<u32>()) {
        let size = WindowSize::from_wire(cols, rows, 0, 0);
        prop_assert_eq!(u32::from(size.cols), cols.min(u32::from(u16::MAX)));
        prop_assert_eq!(u32::from(size.rows), rows.min(u32::from(u16::MAX)));
    }

    #[test]
    fn exit_status_mapping(code in 0i32..256, signal in 1i32..32) {
        prop_assert_eq!(exit_code(ExitStatus::from_raw(code << 8)), code as u32);
        prop_assert_eq!(exit_code(ExitStatus::from_raw(signal)), 128 + signal as u32);
    }

    /// What a client joins into an exec request splits back into the same argv.
    #[test]
    fn quoted_exec_request_splits_to_argv(argv in prop::collection::vec(arg(), 1..6)) {
        let line = shlex::try_join(argv.iter().map(String::as_str)).unwrap();
        prop_assert_eq!(shlex::split(&line), Some(argv));
    }
}
