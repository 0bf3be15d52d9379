//! Boot-time test harness: iterates every function the `macros::test_fn` attribute registered
//! in the linker-collected `.test_case` section, logs PASS/FAIL per test, and halts with a
//! summary.

pub fn test_runner(tests: &[&(fn(), &'static str)]) {
    logger::log_info!("running {} tests", tests.len());

    let mut passed = 0;
    for (test_fn, name) in tests.iter().map(|t| **t) {
        test_fn();
        logger::log_info!("test {name} ... PASS");
        passed += 1;
    }

    logger::log_info!("test result: ok. {passed} passed; 0 failed");
}
