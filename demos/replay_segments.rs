// ABOUTME: Demo replaying a burst of inbound segments through intake, delivery and a restart recovery scan
// ABOUTME: Shows wiring of the in-memory store, channel dispatcher and counting wake-lock

pub(crate) use argh::FromArgs;
use sms_inbound::{
    ChannelDispatcher, Clock, CountingWakeLock, DeliveryConfig, DeliveryStateMachine, IntakeConfig,
    ManualClock, MemorySegmentStore, RecoveryConfig, RecoveryScanner, SegmentRecord, SmsIntake,
    SystemClock, Transport, TransportRouter, WakeLock,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Replay concatenated SMS segments in shuffled order and watch them reassemble
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// number of segments per message (default: 3)
    #[argh(option, short = 'n')]
    segments: Option<u32>,

    /// number of messages to replay (default: 2)
    #[argh(option, short = 'm')]
    messages: Option<u32>,

    /// leave the last segment of the final message undelivered until after the restart
    #[argh(switch, short = 'r')]
    restart: bool,

    /// the sender address (default: +15550100)
    #[argh(option, short = 'f')]
    from: Option<String>,
}

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let count = cli_args.segments.unwrap_or(3).max(1);
    let messages = cli_args.messages.unwrap_or(2);
    let from = cli_args.from.unwrap_or_else(|| "+15550100".to_owned());

    let store = Arc::new(MemorySegmentStore::new());
    let clock = Arc::new(ManualClock::new(SystemClock.now_millis()));
    let wake_lock = Arc::new(CountingWakeLock::new("demo"));

    let (dispatcher, mut broadcasts) = ChannelDispatcher::new();
    let delivery = DeliveryStateMachine::spawn(
        DeliveryConfig::new("gsm-inbound").with_release_delay(Duration::from_millis(200)),
        store.clone(),
        dispatcher,
        wake_lock.clone(),
    );
    let mut intake = SmsIntake::new(IntakeConfig::default(), store.clone(), delivery.clone(), clock.clone());

    let mut held_back = None;
    for reference in 0..messages as i32 {
        // deliver even sequence numbers first, then odd ones, then one retransmission
        let mut order: Vec<i32> = (1..=count as i32).filter(|s| s % 2 == 0).collect();
        order.extend((1..=count as i32).filter(|s| s % 2 == 1));
        order.push(order[0]);

        for sequence in order {
            let segment = SegmentRecord::builder(Transport::Gsm3gpp, vec![reference as u8, sequence as u8])
                .from(from.as_str())
                .part(reference, sequence, count)
                .body(format!("[{reference}.{sequence}]"))
                .build()?;
            if cli_args.restart && reference == messages as i32 - 1 && sequence == count as i32 && count > 1 {
                held_back = Some(segment);
                continue;
            }
            let outcome = intake.on_segment(segment)?;
            println!("ref {reference} seq {sequence}: {outcome:?}");
        }
    }

    let expected = messages as u64 - u64::from(held_back.is_some());
    let mut delivered = 0;
    while delivered < expected {
        let Some(broadcast) = broadcasts.recv().await else {
            break;
        };
        println!(
            "broadcast {} ({} segments): {}",
            broadcast.message.key,
            broadcast.message.segment_count(),
            broadcast.message.body.as_deref().unwrap_or("")
        );
        broadcast.ack.complete();
        delivered += 1;
    }
    let stats = delivery.wait_until(|s| s.completed == expected).await;
    println!("delivery stats: {stats:?}");

    let Some(last) = held_back else {
        delivery.shutdown().await?;
        println!("wake-lock held after shutdown: {}", wake_lock.is_held());
        return Ok(());
    };

    println!("simulating restart with {} live rows", store.live_count()?);
    delivery.shutdown().await?;
    clock.advance(Duration::from_secs(5));

    let (dispatcher, mut broadcasts) = ChannelDispatcher::new();
    let delivery = DeliveryStateMachine::spawn(
        DeliveryConfig::new("gsm-inbound").with_release_delay(Duration::from_millis(200)),
        store.clone(),
        dispatcher,
        wake_lock.clone(),
    );
    let router = TransportRouter::new().with_leg(Transport::Gsm3gpp, delivery.clone());
    let report = RecoveryScanner::new(RecoveryConfig::default(), store.clone(), router, clock.clone())
        .spawn()
        .await??;
    println!("recovery report: {report:?}");

    let mut intake = SmsIntake::new(IntakeConfig::default(), store.clone(), delivery.clone(), clock);
    let adopted = intake.adopt_pending(report.pending)?;
    println!("adopted groups completed on adoption: {}", adopted.len());
    println!("late segment: {:?}", intake.on_segment(last)?);

    if let Some(broadcast) = broadcasts.recv().await {
        println!(
            "broadcast {} ({} segments): {}",
            broadcast.message.key,
            broadcast.message.segment_count(),
            broadcast.message.body.as_deref().unwrap_or("")
        );
        broadcast.ack.complete();
    }
    delivery.wait_until(|s| s.completed == 1).await;
    println!("live rows after replay: {}", store.live_count()?);

    delivery.shutdown().await?;
    println!("wake-lock held after shutdown: {}", wake_lock.is_held());
    Ok(())
}
