use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_core::{Doc, Origin, StateVector, Update};

fn seeded_doc(edits: u32) -> Doc {
    let mut doc = Doc::builder().client_id(1).build();
    let text = doc.get_or_insert_text("body");
    for i in 0..edits {
        doc.run_in_transaction(Origin::Local, |txn| {
            let len = text.len(&*txn);
            text.insert(txn, (i * 7) % (len + 1), "lorem ")
        })
        .unwrap();
    }
    doc
}

fn bench_local_insert(c: &mut Criterion) {
    c.bench_function("text_insert_append_1k", |b| {
        b.iter(|| black_box(seeded_doc(1_000)))
    });
}

fn bench_encode_state(c: &mut Criterion) {
    let doc = seeded_doc(1_000);
    c.bench_function("encode_state_as_update_1k", |b| {
        b.iter(|| black_box(doc.encode_state_as_update(&StateVector::new()).unwrap()))
    });
}

fn bench_decode_update(c: &mut Criterion) {
    let doc = seeded_doc(1_000);
    let bytes = doc.encode_state_as_update(&StateVector::new()).unwrap();
    c.bench_function("decode_update_1k", |b| {
        b.iter(|| black_box(Update::decode(black_box(&bytes)).unwrap()))
    });
}

fn bench_apply_update(c: &mut Criterion) {
    let doc = seeded_doc(1_000);
    let bytes = doc.encode_state_as_update(&StateVector::new()).unwrap();
    c.bench_function("apply_update_fresh_replica_1k", |b| {
        b.iter(|| {
            let mut replica = Doc::builder().client_id(2).build();
            replica
                .apply_update(black_box(&bytes), Origin::Peer("bench".into()))
                .unwrap();
            black_box(replica)
        })
    });
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_encode_state,
    bench_decode_update,
    bench_apply_update
);
criterion_main!(benches);
