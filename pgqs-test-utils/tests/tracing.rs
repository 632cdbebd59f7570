use pgqs_test_utils::init_tracing_for_tests;

#[test]
fn init_tracing_is_idempotent() {
    init_tracing_for_tests();
    init_tracing_for_tests();
}
