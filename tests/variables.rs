//! Variable semantics across parse and execution: rewrites, caching, env.

use flowl::parser::parse;
use flowl::runtime::queue::run_block_statements;

fn calc(ast: &flowl::Ast, name: &str) -> String {
    ast.lookup_var(ast.global(), name).unwrap().calc().unwrap()
}

/// Scenario: rewrite with self-reference. `a <- $(a) + 1` increments and the
/// table stays acyclic.
#[test]
fn self_referential_rewrite_increments() {
    let ast = parse("var a = 1\na <- $(a) + 1\n").unwrap();
    run_block_statements(&ast, ast.global()).unwrap();
    assert_eq!(calc(&ast, "a"), "2");
}

/// Scenario: mutual references are rejected with a cycle error naming one of
/// the variables.
#[test]
fn mutual_reference_is_a_cycle() {
    let err = parse("var a = $(b)\nvar b = $(a)\n").unwrap_err();
    let text = err.to_string();
    assert!(text.contains("cycle"), "{text}");
    assert!(text.contains('a') || text.contains('b'));
}

/// `var a = 100` then `$(a)` evaluates to "100"; `var b = $(a)` sees the
/// rewritten value of `a` on the next read (no stale cache).
#[test]
fn rewrite_invalidates_dependents() {
    let ast = parse("var a = 100\nvar b = $(a)\na <- 200\n").unwrap();

    // First reads populate the caches.
    assert_eq!(calc(&ast, "a"), "100");
    assert_eq!(calc(&ast, "b"), "100");

    run_block_statements(&ast, ast.global()).unwrap();
    assert_eq!(calc(&ast, "a"), "200");
    assert_eq!(calc(&ast, "b"), "200");
}

/// Evaluation is idempotent while no rewrite occurs.
#[test]
fn evaluation_is_idempotent() {
    let ast = parse("var a = 7\nvar b = $(a) * 6\n").unwrap();
    let b = ast.lookup_var(ast.global(), "b").unwrap();
    let first = b.calc().unwrap();
    let second = b.calc().unwrap();
    assert_eq!(first, "42");
    assert_eq!(first, second);
    assert_eq!(b.is_cached(), b.is_cached());
}

/// The reserved `env` root reads the process environment through a field
/// reference.
#[test]
fn env_root_reads_process_environment() {
    // SAFETY: test runs single-threaded with respect to this variable.
    unsafe { std::env::set_var("FLOWL_VAR_TEST", "from-env") };
    let ast = parse("var h = \"$(env.FLOWL_VAR_TEST)\"\n").unwrap();
    assert_eq!(calc(&ast, "h"), "from-env");
}

/// String comparison conditions work when the substituted value is not
/// numeric.
#[test]
fn string_condition_substitution() {
    let ast = parse("var who = \"bob\"\nvar hit = $(who) == \"bob\"\n").unwrap();
    assert_eq!(calc(&ast, "hit"), "true");
}

/// An escaped reference stays literal all the way through evaluation.
#[test]
fn escaped_reference_is_literal() {
    let ast = parse("var x = 1\nvar raw = \"\\$(x)\"\n").unwrap();
    assert_eq!(calc(&ast, "raw"), "$(x)");
}
