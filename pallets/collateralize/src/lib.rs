//! # Collateralize Pallet
//!
//! Collateralized stablecoin lending for CCNY against BTY collateral.
//!
//! ## Overview
//!
//! Approved creators commit CCNY into a *vault* that lends it out.
//! Borrowers post BTY collateral to draw CCNY from a vault, pay a one-shot
//! stability fee on repayment, and are force-liquidated when the market
//! price reaches their liquidation price or their loan term expires. An
//! authorized price feed drives revaluation: one feed transaction can
//! liquidate any number of loans across all open vaults.
//!
//! ## Core Concepts
//!
//! - **Vault**: a creator-owned pool of CCNY offered for lending under
//!   terms snapshotted from the global config at creation
//! - **Loan**: one borrower's debt against one vault, backed by BTY frozen
//!   on the creator's account
//! - **Liquidation price**: the market price at which a loan is seized;
//!   fixed at borrow time, recomputed when collateral is appended
//! - **Warning band**: prices within 1.3× of the liquidation price are
//!   flagged but not yet seized
//! - **Guarantor**: the single address receiving seized collateral
//!
//! ## Security
//!
//! - Flat allow-lists gate configuration, vault creation and price feeds
//! - Committed and collateral funds are held as reserved balances; every
//!   movement goes through the reserve ledger
//! - A failed seizure of one loan is logged and skipped so a single bad
//!   loan cannot stall the oracle pipeline
//! - All arithmetic is integer fixed-point; nothing depends on floats

#![cfg_attr(not(feature = "std"), no_std)]

pub use pallet::*;

pub mod math;

mod index;


#[frame_support::pallet]
pub mod pallet {
    use codec::DecodeWithMemTracking;
    use frame_support::{
        pallet_prelude::*,
        traits::{BalanceStatus, Currency, ExistenceRequirement, ReservableCurrency, UnixTime},
    };
    use frame_system::pallet_prelude::*;
    use sp_runtime::traits::{Hash, SaturatedConversion, Saturating, Zero};
    use sp_std::prelude::*;

    use crate::math;

    /// Balance type shared by both ledgers (CCNY and BTY)
    pub type BalanceOf<T> = <<T as Config>::StableCurrency as Currency<
        <T as frame_system::Config>::AccountId,
    >>::Balance;

    /// Price and ratio scalars - fixed point with 8 decimals
    pub type Price = u128;

    /// Ratio scalars share the price representation
    pub type Ratio = u128;

    /// Seconds since the unix epoch
    pub type Moment = u64;

    /// Per-event ordering key: `height * MAX_TXS_PER_BLOCK + tx_index`
    pub type EventIndex = u64;

    /// Log target for feed-sweep diagnostics
    pub const LOG_TARGET: &str = "runtime::collateralize";

    /// Sat per nominal asset unit
    pub const UNIT: u128 = 100_000_000;

    /// Index headroom for transactions within one block
    pub const MAX_TXS_PER_BLOCK: u64 = 100_000;

    /// Loans enter expiry processing this long before their term ends
    pub const EXPIRE_WARNING_WINDOW: Moment = 10 * 24 * 3600;

    /// Default per-loan debt ceiling (10,000 units)
    pub const DEFAULT_DEBT_CEILING: u128 = 10_000 * UNIT;

    /// Default liquidation ratio (0.4)
    pub const DEFAULT_LIQUIDATION_RATIO: Ratio = 40_000_000;

    /// Default stability fee (0.08)
    pub const DEFAULT_STABILITY_FEE_RATIO: Ratio = 8_000_000;

    /// Default loan term (365 days)
    pub const DEFAULT_PERIOD: Moment = 365 * 24 * 3600;

    /// Listings return this many entries unless asked otherwise
    pub const DEFAULT_LIST_COUNT: u32 = 20;

    /// Hard cap on listing size
    pub const MAX_LIST_COUNT: u32 = 100;

    /// Capacity of each authority allow-list
    pub const MAX_AUTHORITY_ADDRS: u32 = 32;

    // ==================== DATA STRUCTURES ====================

    /// Lifecycle of a vault. Wire values are pinned; they must stay stable
    /// across deployments.
    #[derive(
        Clone,
        Copy,
        Encode,
        Decode,
        DecodeWithMemTracking,
        Eq,
        PartialEq,
        RuntimeDebug,
        TypeInfo,
        MaxEncodedLen,
        Default,
    )]
    pub enum VaultStatus {
        /// Open for lending
        #[default]
        #[codec(index = 1)]
        Created,
        /// All committed funds withdrawn; terminal
        #[codec(index = 2)]
        Closed,
    }

    /// Lifecycle of a loan. Distinct from [`VaultStatus`] even where wire
    /// values coincide.
    #[derive(
        Clone,
        Copy,
        Encode,
        Decode,
        DecodeWithMemTracking,
        Eq,
        PartialEq,
        RuntimeDebug,
        TypeInfo,
        MaxEncodedLen,
        Default,
    )]
    pub enum LoanStatus {
        /// Open and healthy
        #[default]
        #[codec(index = 1)]
        Active,
        /// Market price inside the warning band
        #[codec(index = 2)]
        Warning,
        /// Seized by the price trigger; terminal
        #[codec(index = 3)]
        SystemLiquidated,
        /// Inside the expiry warning window
        #[codec(index = 4)]
        Expiring,
        /// Seized at term end; terminal
        #[codec(index = 5)]
        ExpireLiquidated,
        /// Repaid in full; terminal
        #[codec(index = 6)]
        Closed,
    }

    /// Allow-list roles administered through [`Config::AdminOrigin`]
    #[derive(
        Clone,
        Copy,
        Encode,
        Decode,
        DecodeWithMemTracking,
        Eq,
        PartialEq,
        RuntimeDebug,
        TypeInfo,
        MaxEncodedLen,
    )]
    pub enum Authority {
        /// May edit the global lending terms
        Manager,
        /// May submit price feeds
        PriceFeeder,
        /// May create lending vaults
        VaultCreator,
    }

    /// One borrower's debt against a vault
    #[derive(Clone, Encode, Decode, Eq, PartialEq, RuntimeDebug, TypeInfo)]
    #[scale_info(skip_type_params(T))]
    pub struct BorrowRecord<T: Config> {
        /// Unique id, minted from the opening transaction
        pub record_id: T::Hash,
        /// The vault this loan draws from
        pub vault_id: T::Hash,
        /// The borrower
        pub borrower: T::AccountId,
        /// BTY frozen on the creator's account for this loan
        pub collateral_value: BalanceOf<T>,
        /// CCNY lent out
        pub debt_value: BalanceOf<T>,
        /// Market price captured at borrow or append time
        pub collateral_price: Price,
        /// Price at which the loan is seized
        pub liquidation_price: Price,
        /// When the loan was opened
        pub start_time: Moment,
        /// `start_time + period`; seizure deadline
        pub expire_time: Moment,
        /// Set when the loan is seized, zero otherwise
        pub liquidate_time: Moment,
        /// Current status
        pub status: LoanStatus,
        /// Status before the last transition
        pub pre_status: LoanStatus,
        /// Ordering key of the last transition
        pub index: EventIndex,
        /// Ordering key before the last transition
        pub pre_index: EventIndex,
    }

    /// A creator's lending pool with its embedded loan records
    #[derive(Clone, Encode, Decode, Eq, PartialEq, RuntimeDebug, TypeInfo)]
    #[scale_info(skip_type_params(T))]
    pub struct Vault<T: Config> {
        /// Unique id, minted from the creating transaction
        pub vault_id: T::Hash,
        /// The creator; receives interest and holds the frozen funds
        pub creator: T::AccountId,
        /// CCNY the creator has committed
        pub total_balance: BalanceOf<T>,
        /// CCNY still free to lend
        pub balance: BalanceOf<T>,
        /// BTY currently frozen across all active loans
        pub coll_balance: BalanceOf<T>,
        /// Per-loan cap, snapshotted from the terms at creation
        pub debt_ceiling: BalanceOf<T>,
        /// Collateral ratio, snapshotted at creation
        pub liquidation_ratio: Ratio,
        /// Fee charged on repayment, snapshotted at creation
        pub stability_fee_ratio: Ratio,
        /// Loan term in seconds, snapshotted at creation
        pub period: Moment,
        /// Current status
        pub status: VaultStatus,
        /// Status before the last transition
        pub pre_status: VaultStatus,
        /// Ordering key of the last transition
        pub index: EventIndex,
        /// Ordering key before the last transition
        pub pre_index: EventIndex,
        /// Cached max liquidation price over active loans (0 when none)
        pub latest_liquidation_price: Price,
        /// Cached min expiry over active loans (`Moment::MAX` when none)
        pub latest_expire_time: Moment,
        /// Active loans, in insertion order
        pub borrow_records: Vec<BorrowRecord<T>>,
        /// Closed and liquidated loans, append-only
        pub invalid_records: Vec<BorrowRecord<T>>,
    }

    impl<T: Config> Vault<T> {
        /// Re-derive the cached extrema from the active loan set. Must run
        /// after every mutation of `borrow_records`.
        pub fn refresh_extrema(&mut self) {
            self.latest_liquidation_price = self
                .borrow_records
                .iter()
                .map(|record| record.liquidation_price)
                .max()
                .unwrap_or(0);
            self.latest_expire_time = self
                .borrow_records
                .iter()
                .map(|record| record.expire_time)
                .min()
                .unwrap_or(Moment::MAX);
        }
    }

    /// Global lending terms; vaults snapshot these at creation
    #[derive(Clone, Encode, Decode, Eq, PartialEq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    pub struct LendingTerms<Balance> {
        /// Per-loan borrow cap
        pub debt_ceiling: Balance,
        /// Collateral ratio for new loans
        pub liquidation_ratio: Ratio,
        /// Repayment fee for new loans
        pub stability_fee_ratio: Ratio,
        /// Loan term for new loans, seconds
        pub period: Moment,
        /// System-wide cap on committed vault funds
        pub total_balance: Balance,
        /// Block time of the last edit
        pub current_time: Moment,
    }

    /// Last accepted feed round
    #[derive(Clone, Encode, Decode, Eq, PartialEq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    pub struct PriceRecord {
        /// Volume-weighted BTY price
        pub price: Price,
        /// Block time of the accepting feed
        pub record_time: Moment,
    }

    /// Index entry pointing at a vault in the primary store
    #[derive(Clone, Encode, Decode, Eq, PartialEq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    #[scale_info(skip_type_params(T))]
    pub struct VaultPointer<T: Config> {
        /// Key into [`Vaults`]
        pub vault_id: T::Hash,
        /// Vault status at the indexed event
        pub status: VaultStatus,
    }

    /// Index entry pointing at a loan inside its vault
    #[derive(Clone, Encode, Decode, Eq, PartialEq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    #[scale_info(skip_type_params(T))]
    pub struct RecordPointer<T: Config> {
        /// Key into [`Vaults`]
        pub vault_id: T::Hash,
        /// Loan id within the vault
        pub record_id: T::Hash,
    }

    /// Post-state of a vault-level event; input to the index maintainer
    #[derive(Clone, RuntimeDebug)]
    pub struct VaultReceipt<T: Config> {
        pub vault_id: T::Hash,
        pub creator: T::AccountId,
        pub status: VaultStatus,
        pub pre_status: VaultStatus,
        pub index: EventIndex,
        pub pre_index: EventIndex,
    }

    impl<T: Config> VaultReceipt<T> {
        pub(crate) fn of(vault: &Vault<T>) -> Self {
            Self {
                vault_id: vault.vault_id,
                creator: vault.creator.clone(),
                status: vault.status,
                pre_status: vault.pre_status,
                index: vault.index,
                pre_index: vault.pre_index,
            }
        }
    }

    /// Post-state of a loan-level event; input to the index maintainer
    #[derive(Clone, RuntimeDebug)]
    pub struct RecordReceipt<T: Config> {
        pub vault_id: T::Hash,
        pub record_id: T::Hash,
        pub borrower: T::AccountId,
        pub status: LoanStatus,
        pub pre_status: LoanStatus,
        pub index: EventIndex,
        pub pre_index: EventIndex,
    }

    impl<T: Config> RecordReceipt<T> {
        pub(crate) fn of(record: &BorrowRecord<T>) -> Self {
            Self {
                vault_id: record.vault_id,
                record_id: record.record_id,
                borrower: record.borrower.clone(),
                status: record.status,
                pre_status: record.pre_status,
                index: record.index,
                pre_index: record.pre_index,
            }
        }
    }

    // ==================== PALLET CONFIG ====================

    #[pallet::config]
    pub trait Config: frame_system::Config {
        /// The overarching event type
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        /// Ledger for the lent stable token (CCNY). Committed vault funds
        /// are held as reserved balance on the creator.
        type StableCurrency: ReservableCurrency<Self::AccountId>;

        /// Ledger for the collateral asset (BTY). Posted collateral is held
        /// as reserved balance on the creator.
        type CollateralCurrency: ReservableCurrency<Self::AccountId, Balance = BalanceOf<Self>>;

        /// Wall-clock source; loan terms are measured in seconds
        type TimeProvider: UnixTime;

        /// Origin that administers the authority allow-lists
        type AdminOrigin: EnsureOrigin<Self::RuntimeOrigin>;
    }

    #[pallet::pallet]
    #[pallet::without_storage_info]
    pub struct Pallet<T>(_);

    // ==================== STORAGE ====================

    /// All vaults by id
    #[pallet::storage]
    #[pallet::getter(fn vaults)]
    pub type Vaults<T: Config> = StorageMap<_, Blake2_128Concat, T::Hash, Vault<T>, OptionQuery>;

    /// Global lending terms; unset until the first `manage`
    #[pallet::storage]
    #[pallet::getter(fn lending_terms)]
    pub type Terms<T: Config> = StorageValue<_, LendingTerms<BalanceOf<T>>, OptionQuery>;

    /// Last accepted feed round
    #[pallet::storage]
    #[pallet::getter(fn latest_price)]
    pub type LatestPrice<T: Config> = StorageValue<_, PriceRecord, OptionQuery>;

    /// Addresses allowed to edit the lending terms
    #[pallet::storage]
    #[pallet::getter(fn managers)]
    pub type Managers<T: Config> =
        StorageValue<_, BoundedVec<T::AccountId, ConstU32<MAX_AUTHORITY_ADDRS>>, ValueQuery>;

    /// Addresses allowed to submit price feeds
    #[pallet::storage]
    #[pallet::getter(fn price_feeders)]
    pub type PriceFeeders<T: Config> =
        StorageValue<_, BoundedVec<T::AccountId, ConstU32<MAX_AUTHORITY_ADDRS>>, ValueQuery>;

    /// Addresses allowed to create vaults
    #[pallet::storage]
    #[pallet::getter(fn vault_creators)]
    pub type VaultCreators<T: Config> =
        StorageValue<_, BoundedVec<T::AccountId, ConstU32<MAX_AUTHORITY_ADDRS>>, ValueQuery>;

    /// Recipient of seized collateral
    #[pallet::storage]
    #[pallet::getter(fn guarantor)]
    pub type Guarantor<T: Config> = StorageValue<_, T::AccountId, OptionQuery>;

    /// Vault ids by status and event index
    #[pallet::storage]
    pub type VaultsByStatus<T: Config> = StorageDoubleMap<
        _,
        Twox64Concat,
        VaultStatus,
        Twox64Concat,
        EventIndex,
        T::Hash,
        OptionQuery,
    >;

    /// Vault pointers by creator and event index
    #[pallet::storage]
    pub type VaultsByOwner<T: Config> = StorageDoubleMap<
        _,
        Blake2_128Concat,
        T::AccountId,
        Twox64Concat,
        EventIndex,
        VaultPointer<T>,
        OptionQuery,
    >;

    /// Loan pointers by status and event index
    #[pallet::storage]
    pub type RecordsByStatus<T: Config> = StorageDoubleMap<
        _,
        Twox64Concat,
        LoanStatus,
        Twox64Concat,
        EventIndex,
        RecordPointer<T>,
        OptionQuery,
    >;

    /// Loan pointers by borrower and event index
    #[pallet::storage]
    pub type RecordsByBorrower<T: Config> = StorageDoubleMap<
        _,
        Blake2_128Concat,
        T::AccountId,
        Twox64Concat,
        EventIndex,
        RecordPointer<T>,
        OptionQuery,
    >;

    // ==================== EVENTS ====================

    #[pallet::event]
    #[pallet::generate_deposit(pub(super) fn deposit_event)]
    pub enum Event<T: Config> {
        /// Global lending terms replaced
        TermsUpdated {
            debt_ceiling: BalanceOf<T>,
            liquidation_ratio: Ratio,
            stability_fee_ratio: Ratio,
            period: Moment,
            total_balance: BalanceOf<T>,
        },
        /// A vault was created or topped up
        VaultCreated {
            vault_id: T::Hash,
            creator: T::AccountId,
            total_balance: BalanceOf<T>,
            index: EventIndex,
        },
        /// A loan was drawn against a vault
        LoanOpened {
            vault_id: T::Hash,
            record_id: T::Hash,
            borrower: T::AccountId,
            debt_value: BalanceOf<T>,
            collateral_value: BalanceOf<T>,
            index: EventIndex,
        },
        /// A loan was repaid with interest and its collateral released
        LoanRepaid {
            vault_id: T::Hash,
            record_id: T::Hash,
            borrower: T::AccountId,
            repaid: BalanceOf<T>,
            index: EventIndex,
        },
        /// Extra collateral was posted on an open loan
        CollateralAppended {
            vault_id: T::Hash,
            record_id: T::Hash,
            borrower: T::AccountId,
            amount: BalanceOf<T>,
            status: LoanStatus,
            index: EventIndex,
        },
        /// A feed transitioned a loan (warning, expiry or seizure)
        LoanRevalued {
            vault_id: T::Hash,
            record_id: T::Hash,
            borrower: T::AccountId,
            status: LoanStatus,
            pre_status: LoanStatus,
            index: EventIndex,
            pre_index: EventIndex,
        },
        /// A feed round was accepted and recorded
        PriceRecorded { price: Price, record_time: Moment },
        /// The creator withdrew idle committed balance
        BalanceRetrieved {
            vault_id: T::Hash,
            creator: T::AccountId,
            amount: BalanceOf<T>,
            index: EventIndex,
        },
        /// An authority allow-list was replaced
        AuthoritiesSet { role: Authority, count: u32 },
        /// The seized-collateral recipient was set
        GuarantorSet { guarantor: T::AccountId },
    }

    // ==================== ERRORS ====================

    #[pallet::error]
    pub enum Error<T> {
        /// Caller is not on the required allow-list, or not the creator
        PermissionDenied,
        /// Lending terms outside the admissible range
        RiskParam,
        /// Malformed payload
        InvalidParam,
        /// Non-positive or out-of-range amount
        AmountInvalid,
        /// No usable price: none on record, zero quote, or zero feed
        PriceInvalid,
        /// The vault is not in the state the operation requires
        StatusInvalid,
        /// Referenced loan is not among the vault's active records
        RecordNotFound,
        /// Request exceeds the lendable balance
        LowBalance,
        /// Borrow exceeds the per-loan debt ceiling
        ExceedDebtCeiling,
        /// Payer balance cannot cover the transfer
        NoBalance,
        /// Creator balance cannot cover the committed amount
        InsufficientBalance,
        /// No vault under this id
        VaultNotFound,
        /// Global lending terms have not been configured
        ConfigNotFound,
        /// Allow-list capacity exceeded
        TooManyAuthorities,
        /// Numeric conversion overflowed
        Overflow,
    }

    // ==================== DISPATCHABLES ====================

    #[pallet::call]
    impl<T: Config> Pallet<T> {
        /// Update the global lending terms. Zero fields keep their previous
        /// value; the first call merges over the built-in defaults.
        #[pallet::call_index(0)]
        #[pallet::weight(Weight::from_parts(30_000, 0))]
        pub fn manage(
            origin: OriginFor<T>,
            debt_ceiling: BalanceOf<T>,
            liquidation_ratio: Ratio,
            stability_fee_ratio: Ratio,
            period: Moment,
            total_balance: BalanceOf<T>,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            ensure!(Managers::<T>::get().contains(&who), Error::<T>::PermissionDenied);
            ensure!(
                liquidation_ratio < math::SCALE && stability_fee_ratio < math::SCALE,
                Error::<T>::RiskParam
            );

            let base = Terms::<T>::get().unwrap_or_else(Self::default_terms);
            let merged = LendingTerms {
                debt_ceiling: if debt_ceiling.is_zero() { base.debt_ceiling } else { debt_ceiling },
                liquidation_ratio: if liquidation_ratio == 0 {
                    base.liquidation_ratio
                } else {
                    liquidation_ratio
                },
                stability_fee_ratio: if stability_fee_ratio == 0 {
                    base.stability_fee_ratio
                } else {
                    stability_fee_ratio
                },
                period: if period == 0 { base.period } else { period },
                total_balance: if total_balance.is_zero() {
                    base.total_balance
                } else {
                    total_balance
                },
                current_time: Self::unix_now(),
            };

            Terms::<T>::put(&merged);

            Self::deposit_event(Event::TermsUpdated {
                debt_ceiling: merged.debt_ceiling,
                liquidation_ratio: merged.liquidation_ratio,
                stability_fee_ratio: merged.stability_fee_ratio,
                period: merged.period,
                total_balance: merged.total_balance,
            });

            Ok(())
        }

        /// Commit CCNY as a lending vault. A creator with an open vault
        /// tops it up instead of minting a second one.
        #[pallet::call_index(1)]
        #[pallet::weight(Weight::from_parts(80_000, 0))]
        pub fn create(origin: OriginFor<T>, total_balance: BalanceOf<T>) -> DispatchResult {
            let who = ensure_signed(origin)?;
            ensure!(VaultCreators::<T>::get().contains(&who), Error::<T>::PermissionDenied);
            ensure!(!total_balance.is_zero(), Error::<T>::AmountInvalid);

            let terms = Terms::<T>::get().ok_or(Error::<T>::ConfigNotFound)?;
            let remaining = terms.total_balance.saturating_sub(Self::committed_total());
            ensure!(total_balance <= remaining, Error::<T>::LowBalance);
            ensure!(
                T::StableCurrency::free_balance(&who) >= total_balance,
                Error::<T>::InsufficientBalance
            );

            T::StableCurrency::reserve(&who, total_balance)?;

            let index = Self::event_index();
            let vault = match Self::open_vault_of(&who) {
                Some(vault_id) => {
                    let mut vault =
                        Vaults::<T>::get(vault_id).ok_or(Error::<T>::VaultNotFound)?;
                    vault.total_balance = vault.total_balance.saturating_add(total_balance);
                    vault.balance = vault.balance.saturating_add(total_balance);
                    vault.pre_status = vault.status;
                    vault.pre_index = vault.index;
                    vault.index = index;
                    vault
                }
                None => Vault {
                    vault_id: Self::tx_id(),
                    creator: who.clone(),
                    total_balance,
                    balance: total_balance,
                    coll_balance: Zero::zero(),
                    debt_ceiling: terms.debt_ceiling,
                    liquidation_ratio: terms.liquidation_ratio,
                    stability_fee_ratio: terms.stability_fee_ratio,
                    period: terms.period,
                    status: VaultStatus::Created,
                    pre_status: VaultStatus::Created,
                    index,
                    pre_index: 0,
                    latest_liquidation_price: 0,
                    latest_expire_time: Moment::MAX,
                    borrow_records: Vec::new(),
                    invalid_records: Vec::new(),
                },
            };

            let receipt = VaultReceipt::of(&vault);
            let vault_id = vault.vault_id;
            Vaults::<T>::insert(vault_id, vault);

            Self::reindex_vault(&receipt);
            Self::deposit_event(Event::VaultCreated {
                vault_id,
                creator: who,
                total_balance,
                index,
            });

            Ok(())
        }

        /// Draw CCNY from a vault against freshly posted BTY collateral.
        #[pallet::call_index(2)]
        #[pallet::weight(Weight::from_parts(90_000, 0))]
        pub fn borrow(
            origin: OriginFor<T>,
            vault_id: T::Hash,
            value: BalanceOf<T>,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;

            let mut vault = Vaults::<T>::get(vault_id).ok_or(Error::<T>::VaultNotFound)?;
            ensure!(vault.status != VaultStatus::Closed, Error::<T>::StatusInvalid);
            ensure!(!value.is_zero(), Error::<T>::AmountInvalid);
            ensure!(value <= vault.debt_ceiling, Error::<T>::ExceedDebtCeiling);
            ensure!(value <= vault.balance, Error::<T>::LowBalance);

            let price = LatestPrice::<T>::get().ok_or(Error::<T>::PriceInvalid)?.price;
            let value_sat: u128 = value.try_into().map_err(|_| Error::<T>::Overflow)?;
            let collateral_sat =
                math::collateral_for_debt(value_sat, price, vault.liquidation_ratio)
                    .ok_or(Error::<T>::PriceInvalid)?;
            let collateral: BalanceOf<T> =
                collateral_sat.try_into().map_err(|_| Error::<T>::Overflow)?;

            ensure!(
                T::CollateralCurrency::free_balance(&who) >= collateral,
                Error::<T>::NoBalance
            );

            // Collateral moves to the creator and freezes there; the debt
            // then leaves the creator's frozen stable pool.
            T::CollateralCurrency::transfer(
                &who,
                &vault.creator,
                collateral,
                ExistenceRequirement::AllowDeath,
            )?;
            T::CollateralCurrency::reserve(&vault.creator, collateral)?;
            ensure!(
                T::StableCurrency::reserved_balance(&vault.creator) >= value,
                Error::<T>::NoBalance
            );
            T::StableCurrency::repatriate_reserved(
                &vault.creator,
                &who,
                value,
                BalanceStatus::Free,
            )?;

            let now = Self::unix_now();
            let index = Self::event_index();
            let record = BorrowRecord {
                record_id: Self::tx_id(),
                vault_id,
                borrower: who.clone(),
                collateral_value: collateral,
                debt_value: value,
                collateral_price: price,
                liquidation_price: math::liquidation_price_on_borrow(
                    price,
                    vault.liquidation_ratio,
                ),
                start_time: now,
                expire_time: now.saturating_add(vault.period),
                liquidate_time: 0,
                status: LoanStatus::Active,
                pre_status: LoanStatus::Active,
                index,
                pre_index: 0,
            };
            let receipt = RecordReceipt::of(&record);
            let record_id = record.record_id;

            vault.borrow_records.push(record);
            vault.status = VaultStatus::Created;
            vault.balance = vault.balance.saturating_sub(value);
            vault.coll_balance = vault.coll_balance.saturating_add(collateral);
            vault.refresh_extrema();
            Vaults::<T>::insert(vault_id, vault);

            Self::index_new_record(&receipt);
            Self::deposit_event(Event::LoanOpened {
                vault_id,
                record_id,
                borrower: who,
                debt_value: value,
                collateral_value: collateral,
                index,
            });

            Ok(())
        }

        /// Repay a loan in full, principal plus stability fee; the loan's
        /// collateral returns to the borrower.
        #[pallet::call_index(3)]
        #[pallet::weight(Weight::from_parts(90_000, 0))]
        pub fn repay(
            origin: OriginFor<T>,
            vault_id: T::Hash,
            record_id: T::Hash,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;

            let mut vault = Vaults::<T>::get(vault_id).ok_or(Error::<T>::VaultNotFound)?;
            ensure!(vault.status == VaultStatus::Created, Error::<T>::StatusInvalid);

            let position = vault
                .borrow_records
                .iter()
                .position(|record| record.record_id == record_id)
                .ok_or(Error::<T>::RecordNotFound)?;
            let mut record = vault.borrow_records.remove(position);

            let debt_sat: u128 =
                record.debt_value.try_into().map_err(|_| Error::<T>::Overflow)?;
            let fee: BalanceOf<T> = math::stability_fee(debt_sat, vault.stability_fee_ratio)
                .try_into()
                .map_err(|_| Error::<T>::Overflow)?;
            let repaid = record.debt_value.saturating_add(fee);

            ensure!(T::StableCurrency::free_balance(&who) >= repaid, Error::<T>::NoBalance);

            // Principal and interest both go to the creator; the principal
            // re-freezes into the lendable pool, the interest stays liquid.
            T::StableCurrency::transfer(
                &who,
                &vault.creator,
                repaid,
                ExistenceRequirement::AllowDeath,
            )?;
            T::StableCurrency::reserve(&vault.creator, record.debt_value)?;
            ensure!(
                T::CollateralCurrency::reserved_balance(&vault.creator)
                    >= record.collateral_value,
                Error::<T>::NoBalance
            );
            T::CollateralCurrency::repatriate_reserved(
                &vault.creator,
                &who,
                record.collateral_value,
                BalanceStatus::Free,
            )?;

            let index = Self::event_index();
            record.pre_status = record.status;
            record.status = LoanStatus::Closed;
            record.pre_index = record.index;
            record.index = index;
            let receipt = RecordReceipt::of(&record);

            vault.balance = vault.balance.saturating_add(record.debt_value);
            vault.coll_balance = vault.coll_balance.saturating_sub(record.collateral_value);
            vault.invalid_records.push(record);
            vault.refresh_extrema();
            Vaults::<T>::insert(vault_id, vault);

            Self::reindex_record(&receipt);
            Self::deposit_event(Event::LoanRepaid {
                vault_id,
                record_id,
                borrower: who,
                repaid,
                index,
            });

            Ok(())
        }

        /// Post additional collateral on an open loan, lowering its
        /// liquidation price and possibly clearing a standing warning.
        #[pallet::call_index(4)]
        #[pallet::weight(Weight::from_parts(70_000, 0))]
        pub fn append_collateral(
            origin: OriginFor<T>,
            vault_id: T::Hash,
            record_id: T::Hash,
            collateral_value: BalanceOf<T>,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            ensure!(!collateral_value.is_zero(), Error::<T>::AmountInvalid);

            let mut vault = Vaults::<T>::get(vault_id).ok_or(Error::<T>::VaultNotFound)?;
            ensure!(vault.status == VaultStatus::Created, Error::<T>::StatusInvalid);

            let position = vault
                .borrow_records
                .iter()
                .position(|record| record.record_id == record_id)
                .ok_or(Error::<T>::RecordNotFound)?;

            let price = LatestPrice::<T>::get().ok_or(Error::<T>::PriceInvalid)?.price;
            ensure!(
                T::CollateralCurrency::free_balance(&who) >= collateral_value,
                Error::<T>::NoBalance
            );

            T::CollateralCurrency::transfer(
                &who,
                &vault.creator,
                collateral_value,
                ExistenceRequirement::AllowDeath,
            )?;
            T::CollateralCurrency::reserve(&vault.creator, collateral_value)?;

            let index = Self::event_index();
            let (receipt, status) = {
                let record = &mut vault.borrow_records[position];
                record.collateral_value = record.collateral_value.saturating_add(collateral_value);
                record.collateral_price = price;

                let debt_sat: u128 =
                    record.debt_value.try_into().map_err(|_| Error::<T>::Overflow)?;
                let coll_sat: u128 =
                    record.collateral_value.try_into().map_err(|_| Error::<T>::Overflow)?;
                record.liquidation_price = math::liquidation_price_on_append(debt_sat, coll_sat);

                if math::clears_warning_band(record.liquidation_price, price)
                    && record.status == LoanStatus::Warning
                {
                    record.pre_status = record.status;
                    record.status = LoanStatus::Active;
                    record.pre_index = record.index;
                    record.index = index;
                }

                (RecordReceipt::of(record), record.status)
            };

            vault.coll_balance = vault.coll_balance.saturating_add(collateral_value);
            vault.refresh_extrema();
            // The vault's own event index is deliberately not advanced:
            // appends never re-key the vault in the status index.
            Vaults::<T>::insert(vault_id, vault);

            Self::reindex_record_on_append(&receipt);
            Self::deposit_event(Event::CollateralAppended {
                vault_id,
                record_id,
                borrower: who,
                amount: collateral_value,
                status,
                index,
            });

            Ok(())
        }

        /// Submit a price round. The volume-weighted price is recorded and
        /// every open vault is swept for expiry and price liquidation.
        #[pallet::call_index(5)]
        #[pallet::weight(Weight::from_parts(200_000, 0))]
        pub fn feed(
            origin: OriginFor<T>,
            prices: Vec<Price>,
            volumes: Vec<u128>,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;
            ensure!(
                !prices.is_empty() && prices.len() == volumes.len(),
                Error::<T>::InvalidParam
            );
            ensure!(PriceFeeders::<T>::get().contains(&who), Error::<T>::PermissionDenied);

            let price =
                math::weighted_price(&prices, &volumes).ok_or(Error::<T>::PriceInvalid)?;
            ensure!(price > 0, Error::<T>::PriceInvalid);

            let now = Self::unix_now();
            let index = Self::event_index();

            let mut targets: Vec<(EventIndex, T::Hash)> =
                VaultsByStatus::<T>::iter_prefix(VaultStatus::Created).collect();
            targets.sort_by(|a, b| b.0.cmp(&a.0));

            for (_, vault_id) in targets {
                let mut vault = match Vaults::<T>::get(vault_id) {
                    Some(vault) => vault,
                    None => {
                        log::error!(
                            target: LOG_TARGET,
                            "feed: vault {:?} is indexed but missing from the store",
                            vault_id,
                        );
                        continue;
                    }
                };

                if vault.latest_expire_time.saturating_sub(EXPIRE_WARNING_WINDOW) <= now {
                    Self::expire_sweep(&mut vault, now, index);
                }
                Self::price_sweep(&mut vault, price, now, index);

                vault.refresh_extrema();
                Vaults::<T>::insert(vault_id, vault);
            }

            LatestPrice::<T>::put(PriceRecord { price, record_time: now });
            Self::deposit_event(Event::PriceRecorded { price, record_time: now });

            Ok(())
        }

        /// Withdraw idle committed balance. Only the vault's creator may
        /// call; draining the vault entirely closes it.
        #[pallet::call_index(6)]
        #[pallet::weight(Weight::from_parts(60_000, 0))]
        pub fn retrieve(
            origin: OriginFor<T>,
            vault_id: T::Hash,
            balance: BalanceOf<T>,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;

            let mut vault = Vaults::<T>::get(vault_id).ok_or(Error::<T>::VaultNotFound)?;
            ensure!(who == vault.creator, Error::<T>::PermissionDenied);
            ensure!(balance <= vault.balance, Error::<T>::AmountInvalid);
            ensure!(
                T::StableCurrency::reserved_balance(&who) >= balance,
                Error::<T>::NoBalance
            );

            T::StableCurrency::unreserve(&who, balance);

            let index = Self::event_index();
            vault.total_balance = vault.total_balance.saturating_sub(balance);
            vault.balance = vault.balance.saturating_sub(balance);
            vault.pre_status = vault.status;
            if vault.total_balance.is_zero() {
                vault.status = VaultStatus::Closed;
            }
            vault.pre_index = vault.index;
            vault.index = index;

            let receipt = VaultReceipt::of(&vault);
            Vaults::<T>::insert(vault_id, vault);

            Self::reindex_vault(&receipt);
            Self::deposit_event(Event::BalanceRetrieved {
                vault_id,
                creator: who,
                amount: balance,
                index,
            });

            Ok(())
        }

        /// Replace an authority allow-list
        #[pallet::call_index(7)]
        #[pallet::weight(Weight::from_parts(20_000, 0))]
        pub fn set_authorities(
            origin: OriginFor<T>,
            role: Authority,
            addrs: Vec<T::AccountId>,
        ) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            let addrs: BoundedVec<T::AccountId, ConstU32<MAX_AUTHORITY_ADDRS>> =
                addrs.try_into().map_err(|_| Error::<T>::TooManyAuthorities)?;
            let count = addrs.len() as u32;
            match role {
                Authority::Manager => Managers::<T>::put(addrs),
                Authority::PriceFeeder => PriceFeeders::<T>::put(addrs),
                Authority::VaultCreator => VaultCreators::<T>::put(addrs),
            }

            Self::deposit_event(Event::AuthoritiesSet { role, count });
            Ok(())
        }

        /// Set the recipient of seized collateral
        #[pallet::call_index(8)]
        #[pallet::weight(Weight::from_parts(20_000, 0))]
        pub fn set_guarantor(origin: OriginFor<T>, guarantor: T::AccountId) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            Guarantor::<T>::put(&guarantor);
            Self::deposit_event(Event::GuarantorSet { guarantor });
            Ok(())
        }
    }

    // ==================== HELPER FUNCTIONS ====================

    impl<T: Config> Pallet<T> {
        /// Built-in lending terms, the merge base for the first `manage`
        fn default_terms() -> LendingTerms<BalanceOf<T>> {
            LendingTerms {
                debt_ceiling: DEFAULT_DEBT_CEILING.saturated_into(),
                liquidation_ratio: DEFAULT_LIQUIDATION_RATIO,
                stability_fee_ratio: DEFAULT_STABILITY_FEE_RATIO,
                period: DEFAULT_PERIOD,
                total_balance: Zero::zero(),
                current_time: 0,
            }
        }

        /// Seconds since the epoch for the enclosing block
        fn unix_now() -> Moment {
            T::TimeProvider::now().as_secs()
        }

        /// Ordering key for this transaction: block height scaled by the
        /// per-block capacity, plus the extrinsic position.
        fn event_index() -> EventIndex {
            let height: EventIndex =
                frame_system::Pallet::<T>::block_number().saturated_into();
            let tx_index =
                frame_system::Pallet::<T>::extrinsic_index().unwrap_or(0) as EventIndex;
            height.saturating_mul(MAX_TXS_PER_BLOCK).saturating_add(tx_index)
        }

        /// Deterministic id for objects minted by this transaction
        fn tx_id() -> T::Hash {
            let height = frame_system::Pallet::<T>::block_number();
            let tx_index = frame_system::Pallet::<T>::extrinsic_index().unwrap_or(0);
            T::Hashing::hash_of(&(height, tx_index))
        }

        /// The caller's most recent vault still open for lending, if any
        fn open_vault_of(who: &T::AccountId) -> Option<T::Hash> {
            VaultsByOwner::<T>::iter_prefix(who)
                .filter(|(_, pointer)| pointer.status == VaultStatus::Created)
                .max_by_key(|(index, _)| *index)
                .map(|(_, pointer)| pointer.vault_id)
        }

        /// CCNY already committed across vaults open for lending
        fn committed_total() -> BalanceOf<T> {
            VaultsByStatus::<T>::iter_prefix(VaultStatus::Created)
                .filter_map(|(_, vault_id)| Vaults::<T>::get(vault_id))
                .fold(Zero::zero(), |acc: BalanceOf<T>, vault| {
                    acc.saturating_add(vault.total_balance)
                })
        }

        /// Expiry sweep: seize loans past their term, flag those inside the
        /// warning window. The active list is drained and re-partitioned so
        /// every loan is visited exactly once while entries move out.
        fn expire_sweep(vault: &mut Vault<T>, now: Moment, index: EventIndex) {
            let records = sp_std::mem::take(&mut vault.borrow_records);
            for mut record in records {
                if record.expire_time.saturating_sub(EXPIRE_WARNING_WINDOW) > now {
                    vault.borrow_records.push(record);
                    continue;
                }

                if record.expire_time <= now {
                    if !Self::seize_collateral(vault, &record) {
                        vault.borrow_records.push(record);
                        continue;
                    }
                    record.liquidate_time = now;
                    record.pre_status = record.status;
                    record.status = LoanStatus::ExpireLiquidated;
                    record.pre_index = record.index;
                    record.index = index;
                    vault.coll_balance =
                        vault.coll_balance.saturating_sub(record.collateral_value);
                    Self::note_revaluation(&record);
                    vault.invalid_records.push(record);
                } else {
                    record.pre_index = record.index;
                    record.index = index;
                    record.pre_status = record.status;
                    record.status = LoanStatus::Expiring;
                    Self::note_revaluation(&record);
                    vault.borrow_records.push(record);
                }
            }
        }

        /// Price sweep: seize loans at or under their liquidation price,
        /// flag the warning band, clear warnings the market has left behind.
        fn price_sweep(vault: &mut Vault<T>, price: Price, now: Moment, index: EventIndex) {
            let records = sp_std::mem::take(&mut vault.borrow_records);
            for mut record in records {
                if math::clears_warning_band(record.liquidation_price, price) {
                    // Comfortably safe again: a standing warning is dropped
                    // in place, with no index bump and no receipt. The
                    // status index keeps the warning entry until the next
                    // indexed transition.
                    if record.status == LoanStatus::Warning {
                        record.pre_status = record.status;
                        record.status = LoanStatus::Active;
                    }
                    vault.borrow_records.push(record);
                    continue;
                }

                if record.liquidation_price >= price {
                    if !Self::seize_collateral(vault, &record) {
                        vault.borrow_records.push(record);
                        continue;
                    }
                    record.liquidate_time = now;
                    record.pre_status = record.status;
                    record.status = LoanStatus::SystemLiquidated;
                    record.pre_index = record.index;
                    record.index = index;
                    vault.coll_balance =
                        vault.coll_balance.saturating_sub(record.collateral_value);
                    Self::note_revaluation(&record);
                    vault.invalid_records.push(record);
                } else {
                    record.pre_status = record.status;
                    record.status = LoanStatus::Warning;
                    record.pre_index = record.index;
                    record.index = index;
                    Self::note_revaluation(&record);
                    vault.borrow_records.push(record);
                }
            }
        }

        /// Move a loan's frozen collateral to the guarantor. Failures are
        /// logged and leave the loan untouched; one bad loan must not stall
        /// the whole feed.
        fn seize_collateral(vault: &Vault<T>, record: &BorrowRecord<T>) -> bool {
            let guarantor = match Guarantor::<T>::get() {
                Some(guarantor) => guarantor,
                None => {
                    log::error!(
                        target: LOG_TARGET,
                        "seize: no guarantor configured, skipping loan {:?}",
                        record.record_id,
                    );
                    return false;
                }
            };

            if T::CollateralCurrency::reserved_balance(&vault.creator) < record.collateral_value
            {
                log::error!(
                    target: LOG_TARGET,
                    "seize: creator frozen collateral short for loan {:?}",
                    record.record_id,
                );
                return false;
            }

            match T::CollateralCurrency::repatriate_reserved(
                &vault.creator,
                &guarantor,
                record.collateral_value,
                BalanceStatus::Free,
            ) {
                Ok(_) => true,
                Err(err) => {
                    log::error!(
                        target: LOG_TARGET,
                        "seize: collateral transfer failed for loan {:?}: {:?}",
                        record.record_id,
                        err,
                    );
                    false
                }
            }
        }

        /// Receipt, index rewrite and event for a feed-driven transition
        fn note_revaluation(record: &BorrowRecord<T>) {
            let receipt = RecordReceipt::of(record);
            Self::reindex_record(&receipt);
            Self::deposit_event(Event::LoanRevalued {
                vault_id: record.vault_id,
                record_id: record.record_id,
                borrower: record.borrower.clone(),
                status: record.status,
                pre_status: record.pre_status,
                index: record.index,
                pre_index: record.pre_index,
            });
        }

        // ==================== PUBLIC QUERIES ====================

        /// Remaining system-wide lendable commitment
        pub fn lending_capacity() -> BalanceOf<T> {
            let total = Terms::<T>::get().map(|terms| terms.total_balance).unwrap_or_default();
            total.saturating_sub(Self::committed_total())
        }

        /// Vault ids in `status`, newest first. `start` is an exclusive
        /// upper cursor on the event index.
        pub fn vaults_by_status(
            status: VaultStatus,
            start: Option<EventIndex>,
            count: u32,
        ) -> Vec<T::Hash> {
            Self::page(VaultsByStatus::<T>::iter_prefix(status), start, count)
        }

        /// Vault ids created by `owner`, optionally filtered by status,
        /// newest first.
        pub fn vaults_by_owner(
            owner: &T::AccountId,
            status: Option<VaultStatus>,
            start: Option<EventIndex>,
            count: u32,
        ) -> Vec<T::Hash> {
            let entries = VaultsByOwner::<T>::iter_prefix(owner)
                .filter(|(_, pointer)| status.map_or(true, |s| pointer.status == s))
                .map(|(index, pointer)| (index, pointer.vault_id));
            Self::page(entries, start, count)
        }

        /// Loan pointers in `status`, newest first
        pub fn records_by_status(
            status: LoanStatus,
            start: Option<EventIndex>,
            count: u32,
        ) -> Vec<RecordPointer<T>> {
            Self::page(RecordsByStatus::<T>::iter_prefix(status), start, count)
        }

        /// Loan pointers opened by `borrower`, newest first
        pub fn records_by_borrower(
            borrower: &T::AccountId,
            start: Option<EventIndex>,
            count: u32,
        ) -> Vec<RecordPointer<T>> {
            Self::page(RecordsByBorrower::<T>::iter_prefix(borrower), start, count)
        }

        /// A single loan, searched among the active records first, then the
        /// closed and liquidated ones.
        pub fn borrow_record(vault_id: T::Hash, record_id: T::Hash) -> Option<BorrowRecord<T>> {
            let vault = Vaults::<T>::get(vault_id)?;
            vault
                .borrow_records
                .iter()
                .chain(vault.invalid_records.iter())
                .find(|record| record.record_id == record_id)
                .cloned()
        }

        /// Descending-by-index paging shared by the listings. Double-map
        /// iteration is hash-ordered, so ordering is re-established from
        /// the index key carried in each entry.
        fn page<V>(
            entries: impl Iterator<Item = (EventIndex, V)>,
            start: Option<EventIndex>,
            count: u32,
        ) -> Vec<V> {
            let count = match count {
                0 => DEFAULT_LIST_COUNT,
                n => n.min(MAX_LIST_COUNT),
            } as usize;
            let mut entries: Vec<(EventIndex, V)> = match start {
                Some(start) => entries.filter(|(index, _)| *index < start).collect(),
                None => entries.collect(),
            };
            entries.sort_by(|a, b| b.0.cmp(&a.0));
            entries.truncate(count);
            entries.into_iter().map(|(_, value)| value).collect()
        }
    }
}
