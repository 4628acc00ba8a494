mod cluster;
mod trace;
mod transport;

use std::env;
use std::process;
use std::time::{Duration, Instant};

use cluster::{
    member_channel, AllowAllAuthenticator, ConsensusDriver, EgressMessage, ProtocolMessage,
    SessionMessage, CONSENSUS_STREAM_ID,
};
use trace::decode_state_change;
use transport::{Header, Transport};

const MEMBER_IDS: [i32; 3] = [1, 2, 3];
const EGRESS_STREAM_ID: i32 = 5;
const DEMO_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "demo" => {
                run_demo();
                return;
            }
            _ => {
                print_usage();
                return;
            }
        }
    }

    // Default: run the demo cluster
    run_demo();
}

fn print_usage() {
    eprintln!("Usage: conclave [command]");
    eprintln!("Commands:");
    eprintln!("  demo    - Elect a leader in a 3-member in-process cluster");
    eprintln!("            and run a client session against it");
    eprintln!("  (none)  - Same as 'demo'");
}

/// Run a 3-member cluster on one thread: elect a leader, attach a
/// client session, exchange keep-alives, then close the session and
/// dump the leader's trace records.
fn run_demo() {
    let transport = Transport::new();
    let mut drivers: Vec<ConsensusDriver> = MEMBER_IDS
        .iter()
        .map(|&id| {
            match ConsensusDriver::new(id, &MEMBER_IDS, transport.clone(), Box::new(AllowAllAuthenticator))
            {
                Ok(driver) => driver,
                Err(e) => {
                    eprintln!("FATAL: Failed to start member {}: {}", id, e);
                    process::exit(1);
                }
            }
        })
        .collect();

    let started = Instant::now();
    let mut pump = |drivers: &mut Vec<ConsensusDriver>| {
        let now_ns = started.elapsed().as_nanos() as u64;
        for driver in drivers.iter_mut() {
            driver.do_work(now_ns);
        }
        now_ns
    };

    // Phase 1: leader election
    loop {
        pump(&mut drivers);
        if drivers.iter().all(|d| d.election().is_established()) {
            break;
        }
        if started.elapsed() > DEMO_TIMEOUT {
            eprintln!("FATAL: No leader established within {:?}", DEMO_TIMEOUT);
            process::exit(1);
        }
    }

    let leader_id = drivers
        .iter()
        .find(|d| d.is_leader())
        .map(|d| d.member_id())
        .unwrap_or(-1);
    let term = drivers[0].leadership_term_id();
    println!("Leader established: member {} for term {}", leader_id, term);

    // Phase 2: client session against the leader
    let mut egress = match transport.add_subscription("demo-client", EGRESS_STREAM_ID) {
        Ok(subscription) => subscription,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            process::exit(1);
        }
    };
    let mut ingress = match transport.add_publication(&member_channel(leader_id), CONSENSUS_STREAM_ID) {
        Ok(publication) => publication,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            process::exit(1);
        }
    };

    let connect = ProtocolMessage::Session(SessionMessage::Connect {
        correlation_id: 1,
        response_stream_id: EGRESS_STREAM_ID,
        response_channel: "demo-client".to_string(),
        encoded_credentials: b"demo".to_vec(),
    });
    let bytes = connect.serialize();
    ingress.offer(&bytes, 0, bytes.len());

    let mut session_id = None;
    while session_id.is_none() {
        pump(&mut drivers);
        let mut handler = |buffer: &[u8], offset: usize, length: usize, _header: &Header| {
            if let Ok(EgressMessage::SessionEvent {
                cluster_session_id,
                code,
                ..
            }) = EgressMessage::deserialize(&buffer[offset..offset + length])
            {
                println!("Session event: id={} code={:?}", cluster_session_id, code);
                session_id = Some(cluster_session_id);
            }
        };
        egress.poll(&mut handler, 16);
        if started.elapsed() > DEMO_TIMEOUT {
            eprintln!("FATAL: Session did not open within {:?}", DEMO_TIMEOUT);
            process::exit(1);
        }
    }
    let session_id = session_id.unwrap_or(-1);

    // A few keep-alives, then a clean close.
    for correlation_id in 2..5 {
        let keep_alive = ProtocolMessage::Session(SessionMessage::KeepAlive {
            correlation_id,
            cluster_session_id: session_id,
        });
        let bytes = keep_alive.serialize();
        ingress.offer(&bytes, 0, bytes.len());
        pump(&mut drivers);
    }
    let close = ProtocolMessage::Session(SessionMessage::Close {
        cluster_session_id: session_id,
    });
    let bytes = close.serialize();
    ingress.offer(&bytes, 0, bytes.len());
    for _ in 0..10 {
        pump(&mut drivers);
    }
    println!("Session {} closed", session_id);

    // Phase 3: dump the leader's election trace
    if let Some(leader) = drivers.iter().find(|d| d.member_id() == leader_id) {
        let recorder = leader.election().recorder();
        println!(
            "Leader recorded {} trace records; first transition:",
            recorder.record_count()
        );
        match decode_state_change(recorder.records(), 0) {
            Ok(record) => println!("  member {} {}", record.member_id, record.payload),
            Err(e) => eprintln!("  undecodable first record: {}", e),
        }
    }

    for driver in drivers.iter_mut() {
        driver.close();
    }
}
