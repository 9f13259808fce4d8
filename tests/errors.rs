use std::path::PathBuf;

use scx_schedsim::workload::run_mcarlo;
use scx_schedsim::*;

mod common;
use common::boot;

#[test]
fn test_unknown_canned_tests() {
    let err = CannedTest::new("no_such_test", TopologyKind::QuadCpu).unwrap_err();
    assert!(err.to_string().contains("trivial_bal, basic_bal1, basic_bal2, bal1"));

    let err = CannedTest::new("bal1", TopologyKind::Uniprocessor).unwrap_err();
    assert!(err.to_string().contains("uniprocessor"), "{err}");
}

#[test]
fn test_unknown_topology_falls_back() {
    let _lock = common::setup_test();
    let topo = parse_topology("octo_cpu");
    assert_eq!(topo.kind, TopologyKind::Uniprocessor);
    assert_eq!(topo.nr_cpus, 1);
    assert_eq!(parse_topology("hex_cpu_dual_socket_smt").nr_cpus, 24);
}

#[test]
fn test_mcarlo_config_errors() {
    let _lock = common::setup_test();
    let mut cfg = McarloConfig {
        topology: "quad_cpu".into(),
        workload: PathBuf::from("/nonexistent/workload.tg"),
        ticks: 10,
        seed: 1,
        cpus: CpuMask::from_cpulist("0-2").unwrap(),
        monitor_cpus: CpuMask::from_cpulist("2-3").unwrap(),
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("overlap"), "{err}");

    cfg.monitor_cpus = CpuMask::from_cpulist("3").unwrap();
    cfg.validate().unwrap();
    let err = run_mcarlo(&cfg, SimOptions::default()).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/workload.tg"), "{err:#}");

    cfg.ticks = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_bad_workload_files() {
    let _lock = common::setup_test();
    for text in ["", "0\n", "2\n1024\n", "1\nEXPONENTIAL 100 0\n"] {
        let mut sim = boot(TopologyKind::DualCpu);
        let mut rng = LehmerRng::new(1);
        assert!(
            McarloSim::parse(&mut sim, text, &CpuMask::all(), &mut rng).is_err(),
            "accepted {text:?}"
        );
    }
}

#[test]
fn test_bad_command_line_values() {
    assert!("".parse::<PidSpec>().is_err());
    assert!("12:a/b".parse::<PidSpec>().is_err());
    assert!("12:web:lots".parse::<PidSpec>().is_err());
    assert!(CpuMask::parse("0-").is_err());
    assert!(CpuMask::parse("zz").is_err());
}

#[test]
fn test_replay_setup_errors() {
    let _lock = common::setup_test();
    let pids: Vec<PidSpec> = vec!["1".parse().unwrap()];

    let all = CpuMask::first_n(2);
    assert!(TraceReplay::new(boot(TopologyKind::DualCpu), &all, &pids).is_err());

    let beyond = CpuMask::from_cpu(CpuId(5));
    assert!(TraceReplay::new(boot(TopologyKind::DualCpu), &beyond, &pids).is_err());

    let twice: Vec<PidSpec> = vec!["1".parse().unwrap(), "1:g".parse().unwrap()];
    assert!(TraceReplay::new(boot(TopologyKind::DualCpu), &CpuMask::new(), &twice).is_err());
}

#[test]
fn test_expect_error_messages() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::Uniprocessor);
    sim.create_task(None, 0, 10);
    sim.run_ticks(50);

    let mut exp = Expectations::new();
    let e = TaskExpectation::from_results([1, 1, 5000, 1, 0, 0, 1, 0]);
    let err = exp.validate_results(&sim, &e).unwrap_err();
    assert!(matches!(err, ExpectError::Mismatch { .. }));
    let text = err.to_string();
    assert!(text.starts_with("expected process 1 to have:\nruntime: 5000 ms +- 1 ms\n"));
    assert!(text.contains("Total exec_time = "));
}

#[test]
#[should_panic(expected = "stop work queued on cpu 1")]
fn test_double_stop_work_is_fatal() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::DualCpu);
    let work = scx_schedsim::sched::StopWork::ActiveBalance { target: CpuId(0) };
    sim.stop_one_cpu_nowait(CpuId(1), work);
    sim.stop_one_cpu_nowait(CpuId(1), work);
}
