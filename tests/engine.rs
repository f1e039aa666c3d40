//! End-to-end runs against fake CAPI agents on loopback sockets

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ucc_core::{ErrorKind, RunReport, RunnerBuilder, Verdict};

/// Everything the fake agents saw and sent, in order. Requests are logged
/// as `name>line`, replies as `name<line`.
type Events = Arc<Mutex<Vec<String>>>;

/// Start a fake agent. `respond` maps a request line to `(delay_ms, reply)`
/// pairs written in order.
fn spawn_agent<F>(name: &'static str, events: &Events, respond: F) -> u16
where
    F: Fn(&str) -> Vec<(u64, String)> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let respond = Arc::new(respond);
    let events = Arc::clone(events);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let respond = Arc::clone(&respond);
            let events = Arc::clone(&events);
            std::thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 0 {
                    let request = line.trim().to_string();
                    events.lock().unwrap().push(format!("{}>{}", name, request));
                    for (delay, reply) in respond(&request) {
                        std::thread::sleep(Duration::from_millis(delay));
                        events.lock().unwrap().push(format!("{}<{}", name, reply));
                        if stream.write_all(format!("{}\r\n", reply).as_bytes()).is_err() {
                            return;
                        }
                    }
                    line.clear();
                }
            });
        }
    });
    port
}

fn complete(rest: &str) -> Vec<(u64, String)> {
    let line = if rest.is_empty() {
        "status,COMPLETE".to_string()
    } else {
        format!("status,COMPLETE,{}", rest)
    };
    vec![(0, "status,RUNNING".to_string()), (5, line)]
}

fn write_script(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn runner(script: &Path) -> RunnerBuilder {
    RunnerBuilder::new(script)
        .probe(false)
        .socket_timeout(Duration::from_secs(5))
        .retry(2, Duration::from_millis(50))
}

fn run(script: &Path) -> RunReport {
    runner(script).build().run().unwrap()
}

fn sent(events: &Events, prefix: &str) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .cloned()
        .collect()
}

fn return_value(report: &RunReport, name: &str) -> Option<String> {
    report
        .returns
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

fn position(events: &Events, needle: &str) -> usize {
    let events = events.lock().unwrap();
    events
        .iter()
        .position(|e| e.starts_with(needle))
        .unwrap_or_else(|| panic!("no event starting with {:?} in {:#?}", needle, *events))
}

#[test]
fn test_version_and_returns_flow_into_report() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |req| {
        if req.starts_with("ca_get_version") {
            complete("version,9.1.0")
        } else if req.starts_with("sta_get_mac_address") {
            complete("mac,00:11:22:33:44:55")
        } else {
            complete("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!ca_get_version!DEFAULT!\n\
             wfa_control_agent_dut!sta_get_mac_address,interface,wlan0!mac,$DutMac!\n\
             wfa_control_agent_dut!sta_set_ip_config,interface,wlan0,mac,$DutMac!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert_eq!(report.summary(), "PASS total=1 pass=1 fail=0");
    assert!(!report.stopped_early);
    assert_eq!(report.validation.len(), 1);
    assert_eq!(report.validation[0].version, "9.1.0");
    assert!(report
        .returns
        .contains(&("DutMac".to_string(), "00:11:22:33:44:55".to_string())));
    position(&events, "dut>sta_set_ip_config,interface,wlan0,mac,00:11:22:33:44:55");
}

#[test]
fn test_unresolved_variable_fails_before_sending() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |_| complete(""));
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_associate,interface,wlan0,ssid,$NeverDefined!DEFAULT!\n\
             wfa_control_agent_dut!sta_reset_default,interface,wlan0!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.stopped_early);
    assert_eq!(report.total, 0);
    assert!(events.lock().unwrap().is_empty());
    assert!(report.log.contains("NeverDefined"));
}

#[test]
fn test_error_response_stops_the_run() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |req| {
        if req.starts_with("sta_associate") {
            vec![(0, "status,ERROR,errorCode,no_network".to_string())]
        } else {
            complete("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_associate,ssid,x!DEFAULT!\n\
             wfa_control_agent_dut!sta_reset_default!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.stop_reason.unwrap().contains("ERROR"));
    assert_eq!(events.lock().unwrap().iter().filter(|e| e.starts_with("dut>")).count(), 1);
}

#[test]
fn test_fail_before_separator_is_not_scored() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |req| {
        if req.starts_with("sta_preset_testparameters") {
            vec![(0, "status,COMPLETE,result,FAIL".to_string())]
        } else {
            complete("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_preset_testparameters,supplicant,default!DEFAULT!\n\
             separator!\n\
             wfa_control_agent_dut!sta_reset_default!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert_eq!(report.summary(), "PASS total=1 pass=1 fail=0");
    assert!(!report.stopped_early);
    position(&events, "dut>sta_reset_default");
}

/// Runs the deferred conditional with the agent reporting `rssi` and
/// returns the bound `$Band` plus whether the scan command went out.
fn run_rssi_branch(rssi: &'static str) -> (String, bool) {
    let events = Events::default();
    let port = spawn_agent("dut", &events, move |req| {
        if req.starts_with("sta_get_rssi") {
            complete(&format!("rssi,{}", rssi))
        } else {
            complete("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_get_rssi,interface,wlan0!rssi,$rssi!\n\
             if!$rssi!<!-70!\n\
             define!$Band!weak!\n\
             wfa_control_agent_dut!sta_scan,interface,wlan0!DEFAULT!\n\
             else!\n\
             define!$Band!strong!\n\
             endif!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert!(report.passed(), "{:?}", report.stop_reason);
    let band = report
        .variables
        .iter()
        .find(|(k, _)| k == "Band")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    let scanned = events.lock().unwrap().iter().any(|e| e.contains("sta_scan"));
    (band, scanned)
}

#[test]
fn test_runtime_if_takes_if_branch() {
    assert_eq!(run_rssi_branch("-80"), ("weak".to_string(), true));
}

#[test]
fn test_runtime_if_takes_else_branch() {
    assert_eq!(run_rssi_branch("-50"), ("strong".to_string(), false));
}

#[test]
fn test_receive_stop_waits_for_paired_send() {
    let events = Events::default();
    let tx = spawn_agent("tx", &events, |req| {
        if req.starts_with("traffic_agent_config") {
            complete("streamID,1")
        } else if req.starts_with("traffic_agent_send") {
            vec![
                (0, "status,RUNNING".to_string()),
                (
                    400,
                    "status,COMPLETE,streamID,1,txFrames,100,rxFrames,0,txBytes,125000,rxBytes,0".to_string(),
                ),
            ]
        } else {
            complete("")
        }
    });
    let rx = spawn_agent("rx", &events, |req| {
        if req.starts_with("traffic_agent_config") {
            complete("streamID,2")
        } else if req.starts_with("traffic_agent_receive_stop") {
            complete("streamID,2,txFrames,0,rxFrames,100,txBytes,0,rxBytes,125000")
        } else {
            complete("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_tx!ipaddr=127.0.0.1,port={tx}!\n\
             wfa_control_agent_rx!ipaddr=127.0.0.1,port={rx}!\n\
             wfa_control_agent_rx!traffic_agent_config,profile,File,direction,receive,trafficClass,BestEffort!streamID,$rxStream!\n\
             wfa_control_agent_tx!traffic_agent_config,profile,File,direction,send,frameRate,100!streamID,$txStream!\n\
             wfa_control_agent_rx!traffic_agent_receive_start,streamID,$rxStream!DEFAULT!\n\
             wfa_control_agent_tx!traffic_agent_send,streamID,$txStream!DEFAULT!\n\
             wfa_control_agent_rx!traffic_agent_receive_stop,streamID,$rxStream!DEFAULT!\n\
             checkthroughput!$rxStream!10!>=!0.1!PASS!FAIL!\n\
             checkthroughput!$rxStream!10!>!0.1!PASS!FAIL!\n"
        ),
    );

    let report = run(&script);
    let completed = position(&events, "tx<status,COMPLETE,streamID,1,txFrames");
    let stopped = position(&events, "rx>traffic_agent_receive_stop");
    assert!(completed < stopped, "receive_stop sent before the send completed");

    assert_eq!(report.streams.sent.len(), 1);
    assert_eq!(report.streams.sent[0].tx_bytes, 125000);
    assert_eq!(report.streams.received.len(), 1);
    assert_eq!(report.streams.received[0].stream_id, "2");
    let send_info = report.streams.infos.iter().find(|s| s.stream_id == "1").unwrap();
    assert_eq!(send_info.pair_id.as_deref(), Some("2"));

    // 125000 bytes over 10 s is exactly 0.1 Mbit/s
    assert_eq!(report.passed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.verdict, Verdict::Fail);
}

#[test]
fn test_ap_configuration_forks_and_joins() {
    let events = Events::default();
    let console = spawn_agent("console", &events, |_| complete(""));
    let dut = spawn_agent("dut", &events, |_| complete(""));
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "define!$ActiveAPs!AP1,AP2!\n\
             wfa_console_ctrl!ipaddr=127.0.0.1,port={console}!\n\
             wfa_control_agent_dut!ipaddr=127.0.0.1,port={dut}!\n\
             wfa_console_ctrl!ap_set_wireless,NAME,AP1,SSID,one!DEFAULT!\n\
             wfa_console_ctrl!ap_set_wireless,NAME,AP2,SSID,two!DEFAULT!\n\
             wfa_console_ctrl!ap_config_commit,NAME,AP1!DEFAULT!\n\
             wfa_console_ctrl!ap_config_commit,NAME,AP2!DEFAULT!\n\
             wfa_control_agent_dut!sta_associate,ssid,one!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let runner = RunnerBuilder::new(&script).probe(false).build();
    let compiled = runner.compile_only().unwrap();
    let shape = compiled.queue.to_string();
    assert!(shape.starts_with("fork"), "unexpected queue:\n{}", shape);
    assert!(shape.contains("[AP1]") && shape.contains("[AP2]"));

    let report = run(&script);
    assert!(report.passed(), "{:?}", report.stop_reason);

    // Per-AP order is kept inside each worker, and the station command
    // only goes out after the join.
    let set1 = position(&events, "console>ap_set_wireless,NAME,AP1");
    let commit1 = position(&events, "console>ap_config_commit,NAME,AP1");
    let set2 = position(&events, "console>ap_set_wireless,NAME,AP2");
    let commit2 = position(&events, "console>ap_config_commit,NAME,AP2");
    let associate = position(&events, "dut>sta_associate");
    assert!(set1 < commit1 && set2 < commit2);
    assert!(associate > commit1.max(commit2));
}

#[test]
fn test_define_overwrites_single_entry() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        "define!$Channel!36!\ndefine!$Channel!149!\nresult!PASS!\n",
    );
    let report = run(&script);
    let channels: Vec<&(String, String)> = report.variables.iter().filter(|(k, _)| k == "Channel").collect();
    assert_eq!(channels, vec![&("Channel".to_string(), "149".to_string())]);
}

#[test]
fn test_compile_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "common.txt",
        "define!$SSID!cert-net!\nwfa_control_agent_dut!ipaddr=127.0.0.1,port=9000!\n",
    );
    let script = write_script(
        dir.path(),
        "case.txt",
        "wfa_test_commands!common.txt!\n\
         wfa_control_agent_dut!sta_associate,ssid,$SSID!DEFAULT!\n\
         wfa_control_agent_dut!sta_get_ip_config,interface,wlan0!ip,$ip!\n\
         if!$ip!=!0.0.0.0!\necho!no address!\nendif!\n\
         result!PASS!\n",
    );
    let runner = RunnerBuilder::new(&script).build();
    let a = runner.compile_only().unwrap().to_string();
    let b = runner.compile_only().unwrap().to_string();
    assert_eq!(a, b);
    assert!(a.contains("ssid,cert-net"));
}

#[test]
fn test_include_search_path() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib");
    fs::create_dir(&lib).unwrap();
    write_script(&lib, "devices.txt", "wfa_control_agent_dut!ipaddr=127.0.0.1,port=9000!\n");
    let script = write_script(
        dir.path(),
        "case.txt",
        "wfa_test_commands!devices.txt!\nwfa_control_agent_dut!sta_reset_default!DEFAULT!\n",
    );

    let err = RunnerBuilder::new(&script).build().compile_only().err().unwrap();
    assert_eq!(err.kind, ErrorKind::ConfigError);

    let compiled = RunnerBuilder::new(&script).include_dir(&lib).build().compile_only().unwrap();
    assert_eq!(compiled.queue.tasks()[0].address, "127.0.0.1:9000");
}

#[test]
fn test_recursive_include_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "a.txt", "wfa_test_commands!b.txt!\n");
    write_script(dir.path(), "b.txt", "wfa_test_commands!a.txt!\n");
    let script = dir.path().join("a.txt");
    let err = RunnerBuilder::new(&script).build().compile_only().err().unwrap();
    assert_eq!(err.kind, ErrorKind::SyntaxError);
    assert!(err.message.contains("recursive"));
}

#[test]
fn test_bare_invalid_reply_is_ignored_with_donotblock() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |req| {
        if req.starts_with("sta_associate") {
            vec![(0, "status,INVALID".to_string())]
        } else {
            vec![(0, "status,COMPLETE".to_string())]
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "define!$donotblock!1!\n\
             wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_associate,ssid,x!DEFAULT!\n\
             wfa_control_agent_dut!sta_reset_default!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert!(report.passed(), "{:?}", report.stop_reason);
    assert!(!report.stopped_early);
    assert!(report.duration < Duration::from_secs(2), "took {:?}", report.duration);
    assert_eq!(sent(&events, "dut>").len(), 2);
}

#[test]
fn test_bare_error_reply_stops_promptly() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |_| vec![(0, "status,ERROR".to_string())]);
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_associate,ssid,x!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.stop_reason.unwrap().contains("status,ERROR"));
    assert!(report.duration < Duration::from_secs(2), "took {:?}", report.duration);
}

#[test]
fn test_running_and_complete_in_one_read() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |req| {
        if req.starts_with("sta_get_mac_address") {
            vec![(0, "status,RUNNING\r\nstatus,COMPLETE,mac,aa:bb:cc:dd:ee:ff".to_string())]
        } else {
            vec![(0, "status,COMPLETE".to_string())]
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_get_mac_address,interface,wlan0!mac,$DutMac!\n\
             wfa_control_agent_dut!sta_reset_default!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert!(report.passed(), "{:?}", report.stop_reason);
    assert_eq!(return_value(&report, "DutMac").as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    assert!(report.duration < Duration::from_secs(2), "took {:?}", report.duration);
}

#[test]
fn test_configured_socket_timeout_applies() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |_| Vec::new());
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_associate,ssid,x!DEFAULT!\n\
             wfa_control_agent_dut!sta_reset_default!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = runner(&script)
        .socket_timeout(Duration::from_secs(1))
        .build()
        .run()
        .unwrap();
    assert!(report.duration < Duration::from_secs(4), "took {:?}", report.duration);
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.stopped_early);
    assert!(report.stop_reason.unwrap().contains("no response"));
    assert_eq!(sent(&events, "dut>").len(), 1);
}

#[test]
fn test_script_socktimeout_overrides_configured_timeout() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |_| Vec::new());
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "define!$socktimeout!1!\n\
             wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_associate,ssid,x!DEFAULT!\n"
        ),
    );

    let report = runner(&script)
        .socket_timeout(Duration::from_secs(30))
        .build()
        .run()
        .unwrap();
    assert!(report.duration < Duration::from_secs(4), "took {:?}", report.duration);
    assert!(report.stop_reason.unwrap().contains("within 1s"));
}

#[test]
fn test_deferred_branch_keeps_value_defined_before_it() {
    let events = Events::default();
    let port = spawn_agent("dut", &events, |req| {
        if req.starts_with("sta_get_rssi") {
            complete("rssi,-80")
        } else {
            complete("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "define!$CH!36!\n\
             wfa_control_agent_dut!ipaddr=127.0.0.1,port={port}!\n\
             wfa_control_agent_dut!sta_get_rssi,interface,wlan0!rssi,$rssi!\n\
             if!$rssi!<!-70!\n\
             wfa_control_agent_dut!sta_set_channel,channel,$CH!DEFAULT!\n\
             endif!\n\
             define!$CH!149!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert!(report.passed(), "{:?}", report.stop_reason);
    assert_eq!(sent(&events, "dut>sta_set_channel"), vec!["dut>sta_set_channel,channel,36"]);
}

#[test]
fn test_timed_out_worker_does_not_leak_reply_to_sibling() {
    let events = Events::default();
    let console = spawn_agent("console", &events, |req| {
        if req.starts_with("ap_set_wireless,NAME,AP1") {
            vec![(1500, "status,COMPLETE,mac,slow".to_string())]
        } else if req.starts_with("ap_get_mac_address,NAME,AP2") {
            vec![(0, "status,COMPLETE,mac,two".to_string())]
        } else {
            complete("")
        }
    });
    let dut = spawn_agent("dut", &events, |_| complete(""));
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "define!$ActiveAPs!AP1,AP2!\n\
             wfa_console_ctrl!ipaddr=127.0.0.1,port={console}!\n\
             wfa_control_agent_dut!ipaddr=127.0.0.1,port={dut}!\n\
             wfa_console_ctrl!ap_set_wireless,NAME,AP1,SSID,one!DEFAULT!\n\
             wfa_console_ctrl!ap_get_mac_address,NAME,AP2!mac,$Ap2Mac!\n\
             wfa_control_agent_dut!sta_associate,ssid,one!DEFAULT!\n"
        ),
    );

    let report = runner(&script)
        .socket_timeout(Duration::from_secs(1))
        .build()
        .run()
        .unwrap();
    assert!(report.stopped_early);
    assert_eq!(return_value(&report, "Ap2Mac").as_deref(), Some("two"));
    assert!(sent(&events, "dut>").is_empty());
}

#[test]
fn test_failed_worker_stops_run_after_join() {
    let events = Events::default();
    let console = spawn_agent("console", &events, |req| {
        if req.starts_with("ap_config_commit,NAME,AP1") {
            vec![(0, "status,ERROR,errorCode,commit_failed".to_string())]
        } else if req.starts_with("ap_config_commit,NAME,AP2") {
            vec![(0, "status,RUNNING".to_string()), (200, "status,COMPLETE,name,AP2".to_string())]
        } else {
            complete("")
        }
    });
    let dut = spawn_agent("dut", &events, |_| complete(""));
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "case.txt",
        &format!(
            "define!$ActiveAPs!AP1,AP2!\n\
             wfa_console_ctrl!ipaddr=127.0.0.1,port={console}!\n\
             wfa_control_agent_dut!ipaddr=127.0.0.1,port={dut}!\n\
             wfa_console_ctrl!ap_set_wireless,NAME,AP1,SSID,one!DEFAULT!\n\
             wfa_console_ctrl!ap_set_wireless,NAME,AP2,SSID,two!DEFAULT!\n\
             wfa_console_ctrl!ap_config_commit,NAME,AP1!DEFAULT!\n\
             wfa_console_ctrl!ap_config_commit,NAME,AP2!DEFAULT!\n\
             wfa_control_agent_dut!sta_associate,ssid,one!DEFAULT!\n\
             result!PASS!\n"
        ),
    );

    let report = run(&script);
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.stopped_early);
    assert!(report.stop_reason.unwrap().contains("commit_failed"));
    // The sibling finished its own queue before the join.
    let commit2 = position(&events, "console>ap_config_commit,NAME,AP2");
    assert!(position(&events, "console<status,COMPLETE,name,AP2") > commit2);
    assert!(sent(&events, "dut>").is_empty());
}

/// True when the system `ping` can reach loopback.
fn ping_available() -> bool {
    Command::new("ping")
        .args(["-c", "1", "-W", "1", "127.0.0.1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[test]
fn test_unreachable_device_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    // TEST-NET-1: never routed.
    let script = write_script(
        dir.path(),
        "case.txt",
        "wfa_control_agent_dut!ipaddr=192.0.2.1,port=9000!\n\
         wfa_control_agent_dut!sta_reset_default!DEFAULT!\n\
         result!PASS!\n",
    );

    let report = runner(&script)
        .probe(true)
        .connect_timeout(Duration::from_secs(1))
        .build()
        .run()
        .unwrap();
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.stopped_early);
    assert_eq!(report.total, 0);
    if ping_available() {
        assert!(report.stop_reason.unwrap().contains("unreachable"));
    }
}
