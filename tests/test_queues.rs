// tests/test_queues.rs - Queue planning against a family table.
//
// Family 0 does graphics+compute+transfer with two queues, family 1 is a
// single dedicated compute queue. Transfer therefore lands on family 0.

use ash::vk;
use vk_provision::backend::device::{plan_queues, QueuePriorities};
use vk_provision::backend::physical_device::{QueueFamily, RoleAssignment};
use vk_provision::backend::{ErrorKind, QueueRole};

fn families() -> Vec<QueueFamily> {
    vec![
        QueueFamily::new(
            0,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            2,
        ),
        QueueFamily::new(1, vk::QueueFlags::COMPUTE, 1),
    ]
}

fn role_slot(role: QueueRole) -> usize {
    QueueRole::ALL.iter().position(|&r| r == role).unwrap()
}

#[test]
fn requested_queues_are_clamped_to_capacity() {
    let families = families();
    let roles = RoleAssignment::derive(&families);
    let requests = [
        (
            0,
            QueuePriorities {
                required: vec![1.0],
                requested: vec![0.5, 0.25],
            },
        ),
        (1, QueuePriorities::requested(&[1.0, 1.0])),
    ];

    let layout = plan_queues(&families, &roles, &requests).unwrap();
    assert_eq!(layout.families.len(), 2);
    assert_eq!(layout.families[0].priorities, vec![1.0, 0.5]);
    assert_eq!(layout.families[1].queue_count(), 1);

    assert_eq!(layout.role_count(QueueRole::Graphics), 2);
    assert_eq!(layout.role_count(QueueRole::Transfer), 2);
    assert_eq!(layout.role_count(QueueRole::Compute), 1);
    assert_eq!(layout.role_count(QueueRole::Present), 0);
}

#[test]
fn required_queues_beyond_capacity_fail() {
    let families = families();
    let roles = RoleAssignment::derive(&families);
    let err = plan_queues(&families, &roles, &[(1, QueuePriorities::required(&[1.0, 1.0]))]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingCapability);
}

#[test]
fn requests_for_one_family_merge_with_required_first() {
    let families = families();
    let roles = RoleAssignment::derive(&families);
    let requests = [
        (0, QueuePriorities::requested(&[0.3])),
        (0, QueuePriorities::required(&[0.9])),
    ];
    let layout = plan_queues(&families, &roles, &requests).unwrap();
    assert_eq!(layout.families.len(), 1);
    assert_eq!(layout.families[0].priorities, vec![0.9, 0.3]);
}

#[test]
fn unknown_family_is_a_configuration_error() {
    let families = families();
    let roles = RoleAssignment::derive(&families);
    let err = plan_queues(&families, &roles, &[(7, QueuePriorities::required(&[1.0]))]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
}

#[test]
fn roles_on_one_family_share_queue_slots() {
    let families = families();
    let roles = RoleAssignment::derive(&families);
    let requests = [
        (0, QueuePriorities::required(&[1.0, 1.0])),
        (1, QueuePriorities::required(&[1.0])),
    ];
    let layout = plan_queues(&families, &roles, &requests).unwrap();
    let slots = layout.slots(&roles);

    assert_eq!(slots.unique, vec![(0, 0), (0, 1), (1, 0)]);
    assert_eq!(
        slots.by_role[role_slot(QueueRole::Graphics)],
        slots.by_role[role_slot(QueueRole::Transfer)]
    );
    assert_eq!(slots.by_role[role_slot(QueueRole::Compute)], vec![2]);
    assert!(slots.by_role[role_slot(QueueRole::Present)].is_empty());
}
