use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use dachs_core::{
    Diffable, EntityDescriptor, FieldDescriptor, FieldType, FieldValue, InstanceToken, Snapshot,
};
use dachs_events::{CollectingEntityChangeSetListener, ListenerRegistry};
use dachs_infra::capture::ChangeCapture;
use dachs_infra::in_memory::{GeneratedKey, InMemoryDatabase, Persistable};

static ACCOUNT_FIELDS: [FieldDescriptor; 5] = [
    FieldDescriptor::identity("id", FieldType::Integer),
    FieldDescriptor::state("owner", FieldType::Text),
    FieldDescriptor::state("balance", FieldType::Integer),
    FieldDescriptor::state("labels", FieldType::Set),
    FieldDescriptor::state("active", FieldType::Bool),
];
static ACCOUNT: EntityDescriptor = EntityDescriptor::new("Account", &ACCOUNT_FIELDS);

#[derive(Debug, Clone)]
struct Account {
    id: GeneratedKey,
    owner: String,
    balance: i64,
    active: bool,
}

impl Diffable for Account {
    fn descriptor(&self) -> &'static EntityDescriptor {
        &ACCOUNT
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new()
            .with_opt("id", self.id.get())
            .with("owner", &self.owner)
            .with("balance", self.balance)
            .with("labels", FieldValue::set(["retail", "eu"]))
            .with("active", self.active)
    }

    fn instance_token(&self) -> Option<InstanceToken> {
        Some(self.id.token())
    }
}

impl Persistable for Account {
    fn generated_key(&self) -> Option<&GeneratedKey> {
        Some(&self.id)
    }
}

fn account(i: usize) -> Account {
    Account {
        id: GeneratedKey::new(),
        owner: format!("owner-{i}"),
        balance: i as i64,
        active: true,
    }
}

fn setup() -> InMemoryDatabase {
    let registry = Arc::new(ListenerRegistry::new());
    registry.add_aggregated(Arc::new(CollectingEntityChangeSetListener::new()));
    InMemoryDatabase::new(Arc::new(ChangeCapture::new(registry)))
}

/// Capture + commit of N creations in one unit of work.
fn bench_create_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_commit");

    for n in [10usize, 100, 1000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("creations", n), &n, |b, &n| {
            let db = setup();
            b.iter(|| {
                let mut session = db.session();
                for i in 0..n {
                    session.insert(Arc::new(account(i))).unwrap();
                }
                black_box(session.commit().unwrap());
            });
        });
    }

    group.finish();
}

/// N updates of the same entity netted into one entry.
fn bench_update_netting(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_netting");

    for n in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("updates", n), &n, |b, &n| {
            let db = setup();
            let base = account(0);
            let mut session = db.session();
            session.insert(Arc::new(base.clone())).unwrap();
            session.commit().unwrap();

            b.iter(|| {
                let mut session = db.session();
                for i in 1..=n {
                    let next = Account {
                        balance: black_box(i as i64),
                        ..base.clone()
                    };
                    session.update(Arc::new(next)).unwrap();
                }
                black_box(session.rollback().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_create_commit, bench_update_netting);
criterion_main!(benches);
