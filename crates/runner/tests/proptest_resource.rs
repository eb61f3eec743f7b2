use kiln_runner::ResourceVector;
use proptest::prelude::*;

fn vector_strategy() -> impl Strategy<Value = ResourceVector> {
    prop::collection::btree_map("[a-d]", 0u64..100, 0..4).prop_map(|slots| {
        let mut vector = ResourceVector::new();
        for (kind, amount) in slots {
            vector.set(kind, amount);
        }
        vector
    })
}

proptest! {
    #[test]
    fn zero_amounts_never_survive(vector in vector_strategy()) {
        for (_, amount) in vector.iter() {
            prop_assert!(amount > 0);
        }
    }

    #[test]
    fn add_then_sub_is_identity(a in vector_strategy(), b in vector_strategy()) {
        let mut sum = a.clone();
        sum.add_assign(&b);
        sum.sub_assign(&b);
        prop_assert_eq!(sum, a);
    }

    #[test]
    fn addition_commutes(a in vector_strategy(), b in vector_strategy()) {
        let mut ab = a.clone();
        ab.add_assign(&b);
        let mut ba = b.clone();
        ba.add_assign(&a);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn every_vector_fits_itself(v in vector_strategy()) {
        prop_assert!(v.fits_within(&v));
    }

    #[test]
    fn fits_is_monotone_in_the_cap(v in vector_strategy(), cap in vector_strategy(), extra in vector_strategy()) {
        let mut larger = cap.clone();
        larger.add_assign(&extra);
        if v.fits_within(&cap) {
            prop_assert!(v.fits_within(&larger));
        }
    }

    #[test]
    fn serde_round_trip_preserves_equality(v in vector_strategy()) {
        let json = serde_json::to_string(&v).unwrap();
        let back: ResourceVector = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, v);
    }
}
